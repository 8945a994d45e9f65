//! Connection-emulating datagram endpoints over UDP
//!
//! A client opens a "connection" by sending `CONNECT` to the server socket
//! and waiting for `ACK`. The server keeps one socket for all peers and
//! demultiplexes incoming packets by source address: known peers get their
//! packets forwarded, unknown sources must send `CONNECT` first.
//!
//! Each packet carries exactly one frame.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};

use super::{Accepted, Transport, TransportError, TransportKind, TransportResult};
use crate::protocol::{FrameError, ProtocolError};

/// Sent by a client to open a connection
pub const CONNECT_TOKEN: &str = "CONNECT";

/// Sent by the server to accept a connection
pub const ACK_TOKEN: &str = "ACK";

/// Largest packet we send or receive
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Live peers of a listening socket, keyed by source address
type PeerTable = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>>>;

fn lock_peers(
    peers: &PeerTable,
) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server side of a datagram transport: one socket, many peers
#[derive(Debug)]
pub struct DatagramListener {
    local_addr: SocketAddr,
    peers: PeerTable,
    accepted: tokio::sync::Mutex<mpsc::UnboundedReceiver<Accepted>>,
    shutdown: watch::Sender<bool>,
}

impl DatagramListener {
    /// Bind the shared socket and start demultiplexing
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_demux(socket, peers.clone(), accept_tx, shutdown_rx));

        tracing::debug!("Datagram listener bound to {}", local_addr);

        Ok(Self {
            local_addr,
            peers,
            accepted: tokio::sync::Mutex::new(accept_rx),
            shutdown,
        })
    }

    /// Wait for the next handshake outcome
    pub async fn accept(&self) -> TransportResult<Accepted> {
        let mut accepted = self.accepted.lock().await;
        accepted.recv().await.ok_or(TransportError::Closed)
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    /// Number of peers currently routed by this listener
    pub fn peer_count(&self) -> usize {
        lock_peers(&self.peers).len()
    }

    /// Stop the receive loop. Every accepted endpoint reads end-of-input.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for DatagramListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receive loop of a listening socket
async fn run_demux(
    socket: Arc<UdpSocket>,
    peers: PeerTable,
    accept_tx: mpsc::UnboundedSender<Accepted>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                // ICMP unreachable from an earlier send to a vanished peer
                // surfaces here as reset/refused; the socket itself is fine
                Err(e) if is_transient(&e) => {
                    tracing::debug!("Datagram receive error: {}", e);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Datagram socket failed, closing listener: {}", e);
                    break;
                }
            },
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);

        let forwarded = {
            let mut table = lock_peers(&peers);
            let delivered = table.get(&from).map(|inbox| inbox.send(packet.clone()).is_ok());
            if delivered == Some(false) {
                table.remove(&from);
            }
            delivered == Some(true)
        };
        if forwarded {
            continue;
        }

        let text = String::from_utf8_lossy(&packet);
        let request = text.trim();
        if request != CONNECT_TOKEN {
            tracing::debug!("Rejecting datagram from unknown peer {}", from);
            let rejected = Accepted::Rejected {
                peer: from,
                error: ProtocolError::Handshake {
                    expected: CONNECT_TOKEN.to_string(),
                    received: request.to_string(),
                },
                raw: text.into_owned(),
            };
            if accept_tx.send(rejected).is_err() {
                break;
            }
            continue;
        }

        if let Err(e) = socket.send_to(ACK_TOKEN.as_bytes(), from).await {
            tracing::warn!("Failed to acknowledge {}: {}", from, e);
            continue;
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        lock_peers(&peers).insert(from, inbox_tx);
        tracing::debug!("Datagram peer {} connected", from);

        let endpoint = DatagramEndpoint::new(socket.clone(), from, inbox_rx, Some(peers.clone()));
        if accept_tx.send(Accepted::Peer(Arc::new(endpoint))).is_err() {
            break;
        }
    }

    // Dropping the inbox senders ends every peer's input
    lock_peers(&peers).clear();
    tracing::debug!("Datagram listener stopped");
}

fn is_transient(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// One datagram "connection", either accepted by a listener or opened by a client
#[derive(Debug)]
pub struct DatagramEndpoint {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: watch::Sender<bool>,
    /// Set for listener-side endpoints, which must leave the table on close
    registration: Option<PeerTable>,
}

impl DatagramEndpoint {
    fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbox: mpsc::UnboundedReceiver<Bytes>,
        registration: Option<PeerTable>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket,
            peer,
            inbox: tokio::sync::Mutex::new(inbox),
            closed,
            registration,
        }
    }

    /// Open a connection to a datagram listener.
    ///
    /// Packets that arrive from the server before its `ACK` are held back and
    /// delivered once the handshake completes.
    pub async fn connect(server: SocketAddr, timeout: Duration) -> TransportResult<Self> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let endpoint = Self::new(socket.clone(), server, inbox_rx, None);

        tokio::spawn(run_client_receiver(
            socket.clone(),
            server,
            inbox_tx,
            ack_tx,
            endpoint.closed.subscribe(),
        ));

        socket.send_to(CONNECT_TOKEN.as_bytes(), server).await?;

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => {
                tracing::debug!("Datagram connection to {} acknowledged", server);
                Ok(endpoint)
            }
            _ => {
                endpoint.closed.send_replace(true);
                Err(TransportError::HandshakeTimeout(server))
            }
        }
    }

    fn first_line(packet: &[u8]) -> String {
        let text = String::from_utf8_lossy(packet);
        let line = text.split('\n').next().unwrap_or_default();
        line.strip_suffix('\r').unwrap_or(line).to_string()
    }
}

/// Receive loop of a client socket
async fn run_client_receiver(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    inbox: mpsc::UnboundedSender<Bytes>,
    ack: oneshot::Sender<()>,
    mut closed: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut ack = Some(ack);
    let mut pending: Vec<Bytes> = Vec::new();

    loop {
        let (len, from) = tokio::select! {
            _ = closed.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) if is_transient(&e) => {
                    tracing::debug!("Datagram receive error: {}", e);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Datagram socket failed, closing connection to {}: {}", server, e);
                    break;
                }
            },
        };
        if from != server {
            tracing::debug!("Ignoring datagram from {} (expected {})", from, server);
            continue;
        }
        let packet = Bytes::copy_from_slice(&buf[..len]);

        match ack.take() {
            Some(signal) => {
                if String::from_utf8_lossy(&packet).trim() == ACK_TOKEN {
                    for early in pending.drain(..) {
                        let _ = inbox.send(early);
                    }
                    let _ = signal.send(());
                } else {
                    pending.push(packet);
                    ack = Some(signal);
                }
            }
            None => {
                if inbox.send(packet).is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for DatagramEndpoint {
    async fn send_frame(&self, line: &str) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if line.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::FrameTooLarge(line.len(), MAX_DATAGRAM_SIZE).into());
        }
        self.socket.send_to(line.as_bytes(), self.peer).await?;
        Ok(())
    }

    async fn read_frame(&self) -> TransportResult<Option<String>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut inbox = self.inbox.lock().await;
        let packet = tokio::select! {
            _ = closed.changed() => return Ok(None),
            packet = inbox.recv() => packet,
        };

        match packet {
            Some(packet) => Ok(Some(Self::first_line(&packet))),
            None => {
                self.closed.send_replace(true);
                Ok(None)
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(peers) = &self.registration {
            lock_peers(peers).remove(&self.peer);
        }
    }
}
