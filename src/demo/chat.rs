//! Chat relay demo
//!
//! Clients pick a nickname and send lines; the server relays every line to
//! all other connected clients.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use swiftsocket::protocol::{CodecResult, Decode, Decoder, Encode, Encoder};
use swiftsocket::{Client, ConnectionContext, Executable, NetworkConfig, Server};

/// Session key holding a client's nickname
const NICKNAME_KEY: &str = "nickname";

/// Client -> server: a chat line
#[derive(Debug, Clone, PartialEq)]
pub struct Say {
    pub text: String,
}

/// Client -> server: set the sender's nickname
#[derive(Debug, Clone, PartialEq)]
pub struct Nick {
    pub name: String,
}

/// Server -> client: a relayed chat line
#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub from: String,
    pub text: String,
}

impl Encode for Say {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put(&self.text)
    }
}

impl Decode for Say {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self { text: dec.get()? })
    }
}

impl Encode for Nick {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put(&self.name)
    }
}

impl Decode for Nick {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self { name: dec.get()? })
    }
}

impl Encode for ChatLine {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put(&self.from)?;
        enc.put(&self.text)
    }
}

impl Decode for ChatLine {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self {
            from: dec.get()?,
            text: dec.get()?,
        })
    }
}

/// Messages the chat server understands
#[derive(Debug)]
pub enum ChatRequest {
    Say(Say),
    Nick(Nick),
}

impl From<Say> for ChatRequest {
    fn from(say: Say) -> Self {
        ChatRequest::Say(say)
    }
}

impl From<Nick> for ChatRequest {
    fn from(nick: Nick) -> Self {
        ChatRequest::Nick(nick)
    }
}

/// Lines waiting to be relayed, tagged with their sender
#[derive(Debug, Default)]
pub struct ChatRoom {
    pub outbox: Vec<(Arc<ConnectionContext>, ChatLine)>,
}

impl Executable<ChatRoom> for ChatRequest {
    fn execute(self, origin: &Arc<ConnectionContext>, room: &mut ChatRoom) -> anyhow::Result<()> {
        match self {
            ChatRequest::Nick(Nick { name }) => {
                let name = name.trim();
                anyhow::ensure!(!name.is_empty(), "empty nickname");
                tracing::info!("{} is now known as {}", origin.peer_addr(), name);
                origin.set_value(NICKNAME_KEY, name.to_string());
            }
            ChatRequest::Say(Say { text }) => {
                let from = origin
                    .value::<String>(NICKNAME_KEY)
                    .unwrap_or_else(|| origin.peer_addr().to_string());
                room.outbox.push((origin.clone(), ChatLine { from, text }));
            }
        }
        Ok(())
    }
}

/// Messages the chat client understands
#[derive(Debug)]
pub enum ChatEvent {
    Line(ChatLine),
}

impl From<ChatLine> for ChatEvent {
    fn from(line: ChatLine) -> Self {
        ChatEvent::Line(line)
    }
}

/// Prints relayed lines
#[derive(Debug, Default)]
pub struct Console {
    pub printed: usize,
}

impl Executable<Console> for ChatEvent {
    fn execute(self, _origin: &Arc<ConnectionContext>, console: &mut Console) -> anyhow::Result<()> {
        let ChatEvent::Line(line) = self;
        println!("<{}> {}", line.from, line.text);
        console.printed += 1;
        Ok(())
    }
}

/// Run the relay until Ctrl+C
pub async fn run_server(config: NetworkConfig) -> anyhow::Result<()> {
    let server: Server<ChatRequest> = Server::new(config);
    server.register_inbound_type::<Say>(1)?;
    server.register_inbound_type::<Nick>(2)?;
    server.register_outbound::<ChatLine>(1)?;

    let addr = server.start().await?;
    println!("Chat server listening on {} ({})", addr, server.transport_kind());
    println!("Press Ctrl+C to stop.\n");

    let mut room = ChatRoom::default();
    loop {
        tokio::select! {
            received = server.next_message() => {
                let Some(received) = received else { break };
                if let Err(e) = received.execute(&mut room) {
                    tracing::warn!("{}", e);
                }
                for (origin, line) in room.outbox.drain(..) {
                    for peer in server.contexts().await {
                        if peer.id() == origin.id() {
                            continue;
                        }
                        if let Err(e) = server.send(&peer, &line).await {
                            tracing::debug!("Relay to {} failed: {}", peer.peer_addr(), e);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                server.stop().await?;
                break;
            }
        }
    }

    Ok(())
}

/// Connect, send stdin lines, print relayed lines
pub async fn run_client(config: NetworkConfig, server_addr: SocketAddr, name: String) -> anyhow::Result<()> {
    let client: Client<ChatEvent> = Client::new(config);
    client.register_outbound::<Say>(1)?;
    client.register_outbound::<Nick>(2)?;
    client.register_inbound_type::<ChatLine>(1)?;

    client.connect(server_addr).await?;
    client.send(&Nick { name: name.clone() }).await?;

    println!("Connected to {} as {}", server_addr, name);
    println!("Type a line to send it, /quit to leave.\n");

    let mut console = Console::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            received = client.next_message() => {
                let Some(received) = received else {
                    println!("Disconnected from server");
                    break;
                };
                if let Err(e) = received.execute(&mut console) {
                    tracing::warn!("{}", e);
                }
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim() == "/quit" => break,
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => client.send(&Say { text: line }).await?,
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if client.is_running() {
        client.stop().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftsocket::protocol::codec;

    fn origin() -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext::detached("127.0.0.1:6000".parse().unwrap()))
    }

    #[test]
    fn test_chat_line_wire_format() {
        let line = ChatLine {
            from: "bob".into(),
            text: "hi".into(),
        };
        assert_eq!(codec::encode(&line).unwrap(), "3|bob2|hi");
        assert_eq!(codec::decode::<ChatLine>("3|bob2|hi").unwrap(), line);
    }

    #[test]
    fn test_say_uses_nickname() {
        let origin = origin();
        let mut room = ChatRoom::default();

        ChatRequest::Say(Say { text: "first".into() })
            .execute(&origin, &mut room)
            .unwrap();
        ChatRequest::Nick(Nick { name: " alice ".into() })
            .execute(&origin, &mut room)
            .unwrap();
        ChatRequest::Say(Say { text: "second".into() })
            .execute(&origin, &mut room)
            .unwrap();

        let froms: Vec<_> = room.outbox.iter().map(|(_, l)| l.from.as_str()).collect();
        assert_eq!(froms, vec!["127.0.0.1:6000", "alice"]);
    }

    #[test]
    fn test_empty_nickname_rejected() {
        let mut room = ChatRoom::default();
        let result = ChatRequest::Nick(Nick { name: "  ".into() }).execute(&origin(), &mut room);
        assert!(result.is_err());
    }
}
