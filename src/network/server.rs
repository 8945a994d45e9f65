//! SwiftSocket Server
//!
//! The server accepts peers over the configured transport, runs one
//! connection handler per peer and collects their messages in a single
//! inbound queue.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock as StdRwLock};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use super::connection::{
    ConnectionError, ConnectionHandler, MessageSink, Role, SharedRegistry,
};
use super::dispatch::{Dispatcher, Executable, Received};
use super::{ConnectionContext, KeepAliveSettings, NetworkConfig};
use crate::protocol::{
    CodecResult, Decode, Decoder, Encode, InvalidMessage, MessageId, MessageRegistry,
    ProtocolError,
};
use crate::transport::{Accepted, Listener, Transport, TransportError, TransportKind};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("No live connection to {0}")]
    UnknownPeer(SocketAddr),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// State shared by the server handle, the accept loop and every connection
struct ServerInner<M> {
    transport: TransportKind,
    config: StdRwLock<NetworkConfig>,
    registry: SharedRegistry<M>,
    dispatcher: Dispatcher<M>,
    handlers: RwLock<HashMap<Uuid, Arc<ConnectionHandler<M>>>>,
    running: AtomicBool,
    stopping: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// SwiftSocket Server
///
/// Cheap to clone; all clones drive the same server.
pub struct Server<M> {
    inner: Arc<ServerInner<M>>,
}

impl<M> Clone for Server<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Send + 'static> Server<M> {
    /// Create a new server. The transport kind is fixed for its lifetime.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                transport: config.transport,
                config: StdRwLock::new(config),
                registry: Arc::new(StdRwLock::new(MessageRegistry::new())),
                dispatcher: Dispatcher::new(),
                handlers: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// Register a decoder for client messages with `id`
    pub fn register_inbound<F>(&self, id: MessageId, decode: F) -> ServerResult<()>
    where
        F: Fn(&mut Decoder<'_>) -> CodecResult<M> + Send + Sync + 'static,
    {
        self.registry_mut().register_inbound(id, decode)?;
        Ok(())
    }

    /// Register a decodable type for client messages with `id`
    pub fn register_inbound_type<T>(&self, id: MessageId) -> ServerResult<()>
    where
        T: Decode + Into<M> + 'static,
    {
        self.registry_mut().register_inbound_type::<T>(id)?;
        Ok(())
    }

    /// Register `T` as the server message with `id`
    pub fn register_outbound<T: Encode + 'static>(&self, id: MessageId) -> ServerResult<()> {
        self.registry_mut().register_outbound::<T>(id)?;
        Ok(())
    }

    /// Execute messages with `id` against `target` as soon as they arrive,
    /// instead of queueing them
    pub fn register_execution_context<W>(&self, id: MessageId, target: Arc<tokio::sync::Mutex<W>>)
    where
        W: Send + 'static,
        M: Executable<W>,
    {
        self.inner.dispatcher.register_execution_context(id, target);
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, MessageRegistry<M>> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport
    }

    /// Change keep-alive settings. Applies to connections accepted afterwards.
    pub fn set_keep_alive(&self, settings: KeepAliveSettings) {
        self.inner.write_config().keep_alive = settings;
    }

    pub fn keep_alive(&self) -> KeepAliveSettings {
        self.inner.read_config().keep_alive
    }

    /// Start the server. Returns the bound address.
    pub async fn start(&self) -> ServerResult<SocketAddr> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let (bind_addr, keep_alive) = {
            let config = self.inner.read_config();
            (config.bind_addr(), config.keep_alive)
        };

        if self.inner.transport == TransportKind::Datagram && !keep_alive.enabled {
            tracing::warn!(
                "Datagram server running without keep-alive: dead clients will not be detected"
            );
        }

        let listener = match Listener::bind(self.inner.transport, bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(ServerError::BindFailed(format!(
                    "Failed to bind to {}: {}",
                    bind_addr, e
                )));
            }
        };
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.dispatcher.reopen();

        tracing::info!("Server listening on {} ({})", local_addr, self.inner.transport);

        tokio::spawn(self.inner.clone().run_accept(listener, shutdown_rx));

        Ok(local_addr)
    }

    /// Stop the server: close the listener and let every connection wind down
    pub async fn stop(&self) -> ServerResult<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ServerError::NotRunning);
        }
        self.inner.shutdown().await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Contexts of all live, active connections
    pub async fn contexts(&self) -> Vec<Arc<ConnectionContext>> {
        self.inner
            .handlers
            .read()
            .await
            .values()
            .filter(|h| h.is_active())
            .map(|h| h.context().clone())
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.handlers.read().await.len()
    }

    /// Send a message to one peer
    pub async fn send<T: Encode + 'static>(
        &self,
        context: &ConnectionContext,
        message: &T,
    ) -> ServerResult<()> {
        let handler = self
            .inner
            .handlers
            .read()
            .await
            .get(&context.id())
            .cloned()
            .ok_or(ServerError::UnknownPeer(context.peer_addr()))?;
        handler.send(message).await?;
        Ok(())
    }

    /// Send a message to every active peer. Returns how many received it.
    pub async fn broadcast<T: Encode + 'static>(&self, message: &T) -> ServerResult<usize> {
        let line = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .encode_line(message)?;

        let handlers: Vec<_> = self.inner.handlers.read().await.values().cloned().collect();
        let mut delivered = 0;
        for handler in handlers.iter().filter(|h| h.is_active()) {
            match handler.send_line(&line).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(
                    "Broadcast to {} failed: {}",
                    handler.context().peer_addr(),
                    e
                ),
            }
        }
        Ok(delivered)
    }

    pub fn has_queued_messages(&self) -> bool {
        self.inner.dispatcher.has_queued()
    }

    /// Take the oldest queued message without waiting
    pub fn pull_next_message(&self) -> Option<Received<M>> {
        self.inner.dispatcher.pull()
    }

    /// Wait for the next queued message. Returns `None` once the server has
    /// stopped and the queue is drained.
    pub async fn next_message(&self) -> Option<Received<M>> {
        self.inner.dispatcher.next().await
    }
}

impl<M: Send + 'static> ServerInner<M> {
    fn read_config(&self) -> std::sync::RwLockReadGuard<'_, NetworkConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_config(&self) -> std::sync::RwLockWriteGuard<'_, NetworkConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_accept(self: Arc<Self>, listener: Listener, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(Accepted::Peer(transport)) => self.attach(transport).await,
                Ok(Accepted::Rejected { peer, error, raw }) => {
                    tracing::warn!("Rejected packet from {}: {}", peer, error);
                    let context = Arc::new(ConnectionContext::detached(peer));
                    let invalid = InvalidMessage::new(None, raw, error);
                    self.dispatcher
                        .dispatch(Received::invalid(context, invalid))
                        .await;
                }
                Err(e) => {
                    tracing::error!("Accept error, stopping server: {}", e);
                    break;
                }
            }
        }

        listener.close();
        self.shutdown().await;
    }

    async fn attach(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let peer = transport.peer_addr();
        let shutdown = match self.shutdown_signal() {
            Some(shutdown) if !self.stopping.load(Ordering::SeqCst) => shutdown,
            _ => {
                transport.close().await;
                return;
            }
        };

        let keep_alive = self.read_config().keep_alive.keep_alive();
        let sink: Arc<dyn MessageSink<M>> = self.clone();
        let handler = ConnectionHandler::new(transport, self.registry.clone(), sink, Role::Server);

        self.handlers
            .write()
            .await
            .insert(handler.context().id(), handler.clone());

        tracing::info!("Client connected from {}", peer);
        handler.start_until(keep_alive, shutdown);
    }

    fn shutdown_signal(&self) -> Option<watch::Receiver<bool>> {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(watch::Sender::subscribe)
    }

    /// Stop accepting and end the queue. Each connection notices the
    /// shutdown in its own read loop and disposes itself.
    async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Server shutdown requested");

        if let Some(shutdown) = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take() {
            shutdown.send_replace(true);
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;

        self.dispatcher.close();
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Server stopped");
    }
}

#[async_trait]
impl<M: Send + 'static> MessageSink<M> for ServerInner<M> {
    async fn deliver(&self, received: Received<M>) {
        self.dispatcher.dispatch(received).await;
    }

    async fn release(&self, context: &Arc<ConnectionContext>) {
        self.handlers.write().await.remove(&context.id());
        tracing::debug!("Released connection to {}", context.peer_addr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Encoder;
    use std::net::{IpAddr, Ipv4Addr};

    struct Ping(u32);

    impl Encode for Ping {
        fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
            enc.put(&self.0)
        }
    }

    fn config(kind: TransportKind) -> NetworkConfig {
        NetworkConfig::new(kind, 0).with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server: Server<String> = Server::new(config(TransportKind::Stream));
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
        assert!(!server.has_queued_messages());
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let server: Server<String> = Server::new(config(TransportKind::Stream));
        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(server.next_message().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let first: Server<String> = Server::new(config(TransportKind::Stream));
        let addr = first.start().await.unwrap();

        let mut taken = config(TransportKind::Stream);
        taken.port = addr.port();
        let clash: Server<String> = Server::new(taken);

        assert!(matches!(clash.start().await, Err(ServerError::BindFailed(_))));
        assert!(!clash.is_running());
        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let server: Server<String> = Server::new(config(TransportKind::Stream));
        server.register_outbound::<Ping>(3).unwrap();
        assert!(matches!(
            server.register_outbound::<Ping>(4),
            Err(ServerError::Protocol(ProtocolError::AlreadyRegistered { .. }))
        ));
        assert!(matches!(
            server.register_inbound(999, |dec| dec.get::<String>()),
            Err(ServerError::Protocol(ProtocolError::ReservedId(999)))
        ));
    }

    #[tokio::test]
    async fn test_keep_alive_is_mutable() {
        let server: Server<String> = Server::new(config(TransportKind::Datagram));
        assert!(!server.keep_alive().enabled);
        server.set_keep_alive(KeepAliveSettings::enabled(100, 200));
        assert_eq!(server.keep_alive(), KeepAliveSettings::enabled(100, 200));
        assert_eq!(server.transport_kind(), TransportKind::Datagram);
    }
}
