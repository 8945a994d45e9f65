//! Connection handling for SwiftSocket
//!
//! Manages individual peer connections, including:
//! - Reading frames and decoding them against the registry
//! - Ping/pong keep-alive
//! - Bye-bye handling and disposal

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use super::dispatch::Received;
use super::ConnectionContext;
use crate::protocol::{
    ControlMessage, Decoded, Encode, Frame, InvalidMessage, MessageRegistry, ProtocolError,
    MESSAGE_ID_BYEBYE, MESSAGE_ID_PINGPONG,
};
use crate::transport::{Transport, TransportError};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Registry shared by a coordinator and all of its connections
pub type SharedRegistry<M> = Arc<RwLock<MessageRegistry<M>>>;

/// Which end of the connection this handler serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends pings, expects pongs
    Server,
    /// Answers pings
    Client,
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Active,
    /// Shutdown observed, disposal pending
    Closing,
    Closed,
}

/// Ping timing for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Time between pings
    pub interval: Duration,
    /// How long to wait for the pong
    pub timeout: Duration,
}

/// Receives what a connection decodes and learns when it goes away
#[async_trait]
pub trait MessageSink<M>: Send + Sync {
    /// Hand over an application message or invalid sentinel
    async fn deliver(&self, received: Received<M>);

    /// The connection has been disposed
    async fn release(&self, context: &Arc<ConnectionContext>);
}

/// Drives one peer connection
pub struct ConnectionHandler<M> {
    context: Arc<ConnectionContext>,
    transport: Arc<dyn Transport>,
    registry: SharedRegistry<M>,
    sink: Arc<dyn MessageSink<M>>,
    role: Role,
    state: watch::Sender<HandlerState>,
}

impl<M: Send + 'static> ConnectionHandler<M> {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: SharedRegistry<M>,
        sink: Arc<dyn MessageSink<M>>,
        role: Role,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(HandlerState::Active);
        Arc::new(Self {
            context: Arc::new(ConnectionContext::new(transport.clone())),
            transport,
            registry,
            sink,
            role,
            state,
        })
    }

    /// Spawn the read loop and, if requested, the keep-alive loop
    pub fn start(self: &Arc<Self>, keep_alive: Option<KeepAlive>) {
        self.spawn(keep_alive, None);
    }

    /// Like [`start`](Self::start), but the read loop also ends and disposes
    /// the connection once `shutdown` turns true. No bye-bye is sent.
    pub fn start_until(self: &Arc<Self>, keep_alive: Option<KeepAlive>, shutdown: watch::Receiver<bool>) {
        self.spawn(keep_alive, Some(shutdown));
    }

    fn spawn(self: &Arc<Self>, keep_alive: Option<KeepAlive>, shutdown: Option<watch::Receiver<bool>>) {
        tokio::spawn(self.clone().run_reader(shutdown));
        if let Some(keep_alive) = keep_alive {
            tokio::spawn(self.clone().run_keep_alive(keep_alive));
        }
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandlerState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == HandlerState::Active && self.context.is_active()
    }

    /// Encode and send an application message
    pub async fn send<T: Encode + 'static>(&self, message: &T) -> ConnectionResult<()> {
        let line = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .encode_line(message)?;
        self.send_line(&line).await
    }

    /// Send an already framed line. A transport failure disposes the connection.
    pub async fn send_line(&self, line: &str) -> ConnectionResult<()> {
        if self.state() == HandlerState::Closed {
            return Err(ConnectionError::Closed);
        }
        if let Err(e) = self.transport.send_frame(line).await {
            self.dispose(&format!("send failed: {}", e)).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_control(&self, id: u16) -> ConnectionResult<()> {
        let line = Frame::bare(id).encode().map_err(ProtocolError::from)?;
        self.send_line(&line).await
    }

    /// Tell the peer we are leaving, then close
    pub async fn say_goodbye(&self) {
        if self.state() == HandlerState::Closed {
            return;
        }
        self.begin_closing();
        if let Err(e) = self.send_control(MESSAGE_ID_BYEBYE).await {
            tracing::debug!("Could not send bye-bye to {}: {}", self.context.peer_addr(), e);
        }
        self.dispose("local goodbye").await;
    }

    /// Close the connection for good. Later calls are no-ops.
    pub async fn dispose(&self, reason: &str) {
        if self.state.send_replace(HandlerState::Closed) == HandlerState::Closed {
            return;
        }
        self.context.mark_goodbye();
        self.transport.close().await;
        self.sink.release(&self.context).await;
        tracing::info!("Connection to {} closed: {}", self.context.peer_addr(), reason);
    }

    fn begin_closing(&self) {
        self.state.send_if_modified(|state| {
            if *state == HandlerState::Active {
                *state = HandlerState::Closing;
                true
            } else {
                false
            }
        });
    }

    async fn run_reader(self: Arc<Self>, mut shutdown: Option<watch::Receiver<bool>>) {
        let peer = self.context.peer_addr();
        let reason = loop {
            let read = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break "owner shut down".to_string(),
                read = self.transport.read_frame() => read,
            };
            let line = match read {
                Ok(Some(line)) => line,
                Ok(None) => break "connection closed".to_string(),
                Err(TransportError::Frame(e)) => {
                    let invalid = InvalidMessage::new(None, "", ProtocolError::Frame(e));
                    tracing::warn!("Received {} from {}", invalid, peer);
                    if !self.context.said_goodbye() {
                        self.sink
                            .deliver(Received::invalid(self.context.clone(), invalid))
                            .await;
                    }
                    continue;
                }
                Err(e) => break format!("read error: {}", e),
            };
            tracing::trace!("Received from {}: {:?}", peer, line);

            let decoded = self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .decode_line(&line);

            match decoded {
                Decoded::Control(ControlMessage::PingPong) => self.on_ping_pong().await,
                Decoded::Control(ControlMessage::ByeBye) => {
                    self.context.mark_goodbye();
                    break "peer said goodbye".to_string();
                }
                Decoded::Message { id, body } => {
                    if self.context.said_goodbye() {
                        tracing::debug!("Dropping message {:03} from departed peer {}", id, peer);
                        continue;
                    }
                    self.sink
                        .deliver(Received::message(self.context.clone(), id, body))
                        .await;
                }
                Decoded::Invalid(invalid) => {
                    tracing::warn!("Received {} from {}", invalid, peer);
                    if self.context.said_goodbye() {
                        continue;
                    }
                    self.sink
                        .deliver(Received::invalid(self.context.clone(), invalid))
                        .await;
                }
            }
        };

        self.begin_closing();
        self.dispose(&reason).await;
    }

    async fn on_ping_pong(&self) {
        match self.role {
            Role::Server => {
                tracing::trace!("Pong from {}", self.context.peer_addr());
                self.context.mark_pong();
            }
            Role::Client => {
                if let Err(e) = self.send_control(MESSAGE_ID_PINGPONG).await {
                    tracing::debug!("Could not answer ping: {}", e);
                }
            }
        }
    }

    async fn run_keep_alive(self: Arc<Self>, keep_alive: KeepAlive) {
        let peer = self.context.peer_addr();
        let mut state = self.state.subscribe();
        let mut ticker =
            tokio::time::interval_at(Instant::now() + keep_alive.interval, keep_alive.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            "Keep-alive for {} every {:?} (timeout {:?})",
            peer,
            keep_alive.interval,
            keep_alive.timeout
        );

        loop {
            tokio::select! {
                _ = closing(&mut state) => break,
                _ = ticker.tick() => {}
            }

            self.context.record_ping();
            if self.send_control(MESSAGE_ID_PINGPONG).await.is_err() {
                break;
            }

            let answered = tokio::select! {
                _ = closing(&mut state) => break,
                waited = tokio::time::timeout(keep_alive.timeout, self.context.wait_for_pong()) => waited.is_ok(),
            };

            if !answered {
                tracing::warn!("No pong from {} within {:?}", peer, keep_alive.timeout);
                self.dispose("keep-alive timeout").await;
                break;
            }
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(shutdown) => {
            let _ = shutdown.wait_for(|stop| *stop).await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves once the handler has left the active state
async fn closing(state: &mut watch::Receiver<HandlerState>) {
    while *state.borrow_and_update() == HandlerState::Active {
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Inbound;
    use crate::protocol::{CodecResult, Decoder, Encoder};
    use crate::transport::TransportResult;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, Notify};

    /// In-memory transport fed from a channel
    #[derive(Debug)]
    struct MockTransport {
        incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
        sent: Mutex<Vec<String>>,
        closed: watch::Sender<bool>,
    }

    impl MockTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let (closed, _) = watch::channel(false);
            let transport = Arc::new(Self {
                incoming: tokio::sync::Mutex::new(rx),
                sent: Mutex::new(Vec::new()),
                closed,
            });
            (transport, tx)
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_frame(&self, line: &str) -> TransportResult<()> {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        async fn read_frame(&self) -> TransportResult<Option<String>> {
            let mut closed = self.closed.subscribe();
            if *closed.borrow() {
                return Ok(None);
            }
            let mut incoming = self.incoming.lock().await;
            tokio::select! {
                _ = closed.changed() => Ok(None),
                line = incoming.recv() => Ok(line),
            }
        }

        fn peer_addr(&self) -> SocketAddr {
            "127.0.0.1:7000".parse().unwrap()
        }

        fn kind(&self) -> crate::transport::TransportKind {
            crate::transport::TransportKind::Stream
        }

        fn is_closed(&self) -> bool {
            *self.closed.borrow()
        }

        async fn close(&self) {
            self.closed.send_replace(true);
        }
    }

    /// Sink that records deliveries and releases
    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<VecDeque<Received<String>>>,
        released: Mutex<usize>,
        changed: Notify,
    }

    impl RecordingSink {
        async fn wait_until(&self, check: impl Fn(&Self) -> bool) {
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let notified = self.changed.notified();
                    if check(self) {
                        return;
                    }
                    notified.await;
                }
            })
            .await
            .expect("condition not reached in time");
        }

        fn delivered(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }

        fn released(&self) -> usize {
            *self.released.lock().unwrap()
        }
    }

    #[async_trait]
    impl MessageSink<String> for RecordingSink {
        async fn deliver(&self, received: Received<String>) {
            self.delivered.lock().unwrap().push_back(received);
            self.changed.notify_waiters();
        }

        async fn release(&self, _context: &Arc<ConnectionContext>) {
            *self.released.lock().unwrap() += 1;
            self.changed.notify_waiters();
        }
    }

    struct Say(String);

    impl Encode for Say {
        fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
            enc.put(&self.0)
        }
    }

    fn registry() -> SharedRegistry<String> {
        let mut registry = MessageRegistry::new();
        registry
            .register_inbound(1, |dec: &mut Decoder<'_>| dec.get::<String>())
            .unwrap();
        registry.register_outbound::<Say>(1).unwrap();
        Arc::new(RwLock::new(registry))
    }

    fn handler(role: Role) -> (Arc<ConnectionHandler<String>>, Arc<MockTransport>, mpsc::UnboundedSender<String>, Arc<RecordingSink>) {
        let (transport, tx) = MockTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let handler = ConnectionHandler::new(transport.clone(), registry(), sink.clone(), role);
        (handler, transport, tx, sink)
    }

    #[tokio::test]
    async fn test_messages_are_delivered() {
        let (handler, _transport, tx, sink) = handler(Role::Server);
        handler.start(None);

        tx.send("0012|hi".into()).unwrap();
        tx.send("0421|x".into()).unwrap();
        sink.wait_until(|s| s.delivered() == 2).await;

        let delivered = sink.delivered.lock().unwrap().drain(..).collect::<Vec<_>>();
        assert!(matches!(&delivered[0].message, Inbound::Message { id: 1, body } if body == "hi"));
        assert!(delivered[1].is_invalid());
        assert!(handler.is_active());
    }

    #[tokio::test]
    async fn test_client_answers_ping() {
        let (handler, transport, tx, sink) = handler(Role::Client);
        handler.start(None);

        tx.send("999".into()).unwrap();
        tx.send("0012|ok".into()).unwrap();
        sink.wait_until(|s| s.delivered() == 1).await;

        assert_eq!(transport.sent(), vec!["999\n".to_string()]);
    }

    #[tokio::test]
    async fn test_byebye_disposes_and_suppresses_delivery() {
        let (handler, transport, tx, sink) = handler(Role::Server);
        handler.start(None);

        tx.send("998".into()).unwrap();
        tx.send("0012|hi".into()).unwrap();
        sink.wait_until(|s| s.released() == 1).await;

        assert_eq!(handler.state(), HandlerState::Closed);
        assert!(handler.context().said_goodbye());
        assert!(!handler.context().is_active());
        assert!(transport.is_closed());
        assert_eq!(sink.delivered(), 0);
        assert!(matches!(handler.send(&Say("late".into())).await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_disposes_without_goodbye() {
        let (handler, transport, _tx, sink) = handler(Role::Server);
        let (stop, stopped) = watch::channel(false);
        handler.start_until(None, stopped);

        stop.send_replace(true);
        sink.wait_until(|s| s.released() == 1).await;

        assert_eq!(handler.state(), HandlerState::Closed);
        assert!(transport.is_closed());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (handler, _transport, _tx, sink) = handler(Role::Server);
        handler.start(None);

        handler.dispose("first").await;
        handler.dispose("second").await;
        sink.wait_until(|s| s.released() >= 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.released(), 1);
    }

    #[tokio::test]
    async fn test_say_goodbye_sends_byebye() {
        let (handler, transport, _tx, sink) = handler(Role::Client);
        handler.start(None);
        handler.send(&Say("hi".into())).await.unwrap();
        handler.say_goodbye().await;

        assert_eq!(transport.sent(), vec!["0012|hi\n".to_string(), "998\n".to_string()]);
        assert!(transport.is_closed());
        sink.wait_until(|s| s.released() == 1).await;
    }

    #[tokio::test]
    async fn test_keep_alive_timeout_disposes() {
        let (handler, transport, _tx, sink) = handler(Role::Server);
        handler.start(Some(KeepAlive {
            interval: Duration::from_millis(30),
            timeout: Duration::from_millis(60),
        }));

        sink.wait_until(|s| s.released() == 1).await;
        assert_eq!(transport.sent().first().map(String::as_str), Some("999\n"));
        assert!(handler.context().last_ping().is_some());
        assert_eq!(handler.state(), HandlerState::Closed);
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let (handler, transport, tx, sink) = handler(Role::Server);
        handler.start(Some(KeepAlive {
            interval: Duration::from_millis(30),
            timeout: Duration::from_millis(200),
        }));

        // Answer every ping for a while
        let deadline = Instant::now() + Duration::from_millis(400);
        let mut answered = 0;
        while Instant::now() < deadline {
            let pings = transport.sent().iter().filter(|l| *l == "999\n").count();
            while answered < pings {
                tx.send("999".into()).unwrap();
                answered += 1;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(answered >= 3);
        assert_eq!(sink.released(), 0);
        assert!(handler.is_active());
        handler.dispose("test over").await;
    }
}
