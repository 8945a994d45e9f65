//! Shared fixtures for the loopback tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use swiftsocket::protocol::CodecResult;
use swiftsocket::{
    ConnectionContext, Decode, Decoder, Encode, Encoder, Executable, NetworkConfig, Server,
    TransportKind,
};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(3);

/// A single-string message
#[derive(Debug, Clone, PartialEq)]
pub struct Text(pub String);

impl Text {
    pub fn new(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl Encode for Text {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put(&self.0)
    }
}

impl Decode for Text {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self(dec.get()?))
    }
}

/// Application message enum used on both sides
#[derive(Debug, PartialEq)]
pub enum Event {
    Text(Text),
}

impl From<Text> for Event {
    fn from(text: Text) -> Self {
        Event::Text(text)
    }
}

/// Records everything executed against it
#[derive(Debug, Default)]
pub struct Journal {
    pub entries: Vec<String>,
}

impl Executable<Journal> for Event {
    fn execute(self, _origin: &Arc<ConnectionContext>, journal: &mut Journal) -> anyhow::Result<()> {
        let Event::Text(Text(text)) = self;
        journal.entries.push(format!("text:{}", text));
        Ok(())
    }
}

/// Loopback config on an ephemeral port
pub fn local(kind: TransportKind) -> NetworkConfig {
    NetworkConfig::new(kind, 0)
        .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_connect_timeout(1000)
}

/// Wait until the server holds exactly `count` live connections
pub async fn wait_for_connections<M: Send + 'static>(server: &Server<M>, count: usize) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if server.connection_count().await == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
