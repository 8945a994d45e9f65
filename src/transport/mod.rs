//! Transport module - Moves framed lines between two endpoints
//!
//! Provides:
//! - [`Transport`], the per-peer endpoint a connection reads from and writes to
//! - Stream endpoints over TCP
//! - Datagram endpoints over UDP, with a connection handshake and a
//!   per-socket demultiplexer on the listening side
//! - [`Listener`] for accepting peers of either kind

mod datagram;
mod stream;

pub use datagram::*;
pub use stream::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{FrameError, ProtocolError};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport closed")]
    Closed,

    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(SocketAddr),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Which socket type carries the frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Reliable ordered byte stream (TCP)
    #[default]
    Stream,
    /// Connection-emulating datagrams (UDP)
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Datagram => write!(f, "datagram"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(TransportKind::Stream),
            "datagram" | "udp" => Ok(TransportKind::Datagram),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// One endpoint of a peer-to-peer line channel.
///
/// Lines are passed without their `\n` terminator on read; `send_frame`
/// expects a complete frame including the terminator.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Write one complete frame
    async fn send_frame(&self, line: &str) -> TransportResult<()>;

    /// Read the next line. Returns `Ok(None)` once the endpoint is closed
    /// or the peer has gone away.
    async fn read_frame(&self) -> TransportResult<Option<String>>;

    /// Remote peer address
    fn peer_addr(&self) -> SocketAddr;

    fn kind(&self) -> TransportKind;

    fn is_closed(&self) -> bool;

    /// Release the endpoint. Pending and future reads return `Ok(None)`.
    async fn close(&self);
}

/// Result of one accept step
#[derive(Debug)]
pub enum Accepted {
    /// A new peer endpoint
    Peer(Arc<dyn Transport>),
    /// A packet from an unknown source that was not a connect request
    Rejected {
        peer: SocketAddr,
        error: ProtocolError,
        /// The packet text as received
        raw: String,
    },
}

/// Server side of a transport
#[derive(Debug)]
pub enum Listener {
    Stream(tokio::net::TcpListener),
    Datagram(DatagramListener),
}

impl Listener {
    /// Bind a listener of the given kind
    pub async fn bind(kind: TransportKind, addr: SocketAddr) -> TransportResult<Self> {
        match kind {
            TransportKind::Stream => Ok(Listener::Stream(tokio::net::TcpListener::bind(addr).await?)),
            TransportKind::Datagram => Ok(Listener::Datagram(DatagramListener::bind(addr).await?)),
        }
    }

    /// Wait for the next peer
    pub async fn accept(&self) -> TransportResult<Accepted> {
        match self {
            Listener::Stream(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Accepted::Peer(Arc::new(StreamEndpoint::new(stream, addr))))
            }
            Listener::Datagram(listener) => listener.accept().await,
        }
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        match self {
            Listener::Stream(listener) => Ok(listener.local_addr()?),
            Listener::Datagram(listener) => listener.local_addr(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Listener::Stream(_) => TransportKind::Stream,
            Listener::Datagram(_) => TransportKind::Datagram,
        }
    }

    /// Stop accepting. Datagram peers stop receiving as well.
    pub fn close(&self) {
        if let Listener::Datagram(listener) = self {
            listener.close();
        }
    }
}

/// Connect to a listening peer
pub async fn connect(
    kind: TransportKind,
    addr: SocketAddr,
    timeout: Duration,
) -> TransportResult<Arc<dyn Transport>> {
    match kind {
        TransportKind::Stream => Ok(Arc::new(StreamEndpoint::connect(addr, timeout).await?)),
        TransportKind::Datagram => Ok(Arc::new(DatagramEndpoint::connect(addr, timeout).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("stream".parse::<TransportKind>().unwrap(), TransportKind::Stream);
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Stream);
        assert_eq!("udp".parse::<TransportKind>().unwrap(), TransportKind::Datagram);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Datagram.to_string(), "datagram");
    }
}
