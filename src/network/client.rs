//! SwiftSocket Client
//!
//! Connects to a SwiftSocket server over either transport, answers its pings
//! and queues the messages it sends.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use thiserror::Error;
use tokio::sync::RwLock;

use super::connection::{ConnectionError, ConnectionHandler, MessageSink, Role, SharedRegistry};
use super::dispatch::{Dispatcher, Executable, Received};
use super::{ConnectionContext, NetworkConfig};
use crate::protocol::{CodecResult, Decode, Decoder, Encode, MessageId, MessageRegistry, ProtocolError};
use crate::transport::{self, TransportError, TransportKind};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

struct ClientInner<M> {
    config: NetworkConfig,
    registry: SharedRegistry<M>,
    dispatcher: Dispatcher<M>,
    state: RwLock<ClientState>,
    handler: RwLock<Option<Arc<ConnectionHandler<M>>>>,
    running: AtomicBool,
}

/// SwiftSocket Client
///
/// Cheap to clone; all clones drive the same connection.
pub struct Client<M> {
    inner: Arc<ClientInner<M>>,
}

impl<M> Clone for Client<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Send + 'static> Client<M> {
    /// Create a new client. The transport kind is taken from `config`.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                registry: Arc::new(StdRwLock::new(MessageRegistry::new())),
                dispatcher: Dispatcher::new(),
                state: RwLock::new(ClientState::Disconnected),
                handler: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Register a decoder for server messages with `id`
    pub fn register_inbound<F>(&self, id: MessageId, decode: F) -> ClientResult<()>
    where
        F: Fn(&mut Decoder<'_>) -> CodecResult<M> + Send + Sync + 'static,
    {
        self.registry_mut().register_inbound(id, decode)?;
        Ok(())
    }

    /// Register a decodable type for server messages with `id`
    pub fn register_inbound_type<T>(&self, id: MessageId) -> ClientResult<()>
    where
        T: Decode + Into<M> + 'static,
    {
        self.registry_mut().register_inbound_type::<T>(id)?;
        Ok(())
    }

    /// Register `T` as the client message with `id`
    pub fn register_outbound<T: Encode + 'static>(&self, id: MessageId) -> ClientResult<()> {
        self.registry_mut().register_outbound::<T>(id)?;
        Ok(())
    }

    /// Execute messages with `id` against `target` as soon as they arrive
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
        self.inner.config.transport
    }

    /// Connect to a server by address.
    ///
    /// For datagrams this completes the `CONNECT`/`ACK` handshake before
    /// returning.
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<()> {
        {
            let mut state = self.inner.state.write().await;
            if *state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ClientState::Connecting;
        }

        tracing::info!("Connecting to {} ({})", server_addr, self.inner.config.transport);

        let endpoint = match transport::connect(
            self.inner.config.transport,
            server_addr,
            self.inner.config.connect_timeout(),
        )
        .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                *self.inner.state.write().await = ClientState::Disconnected;
                return Err(e.into());
            }
        };

        let sink: Arc<dyn MessageSink<M>> = self.inner.clone();
        let handler = ConnectionHandler::new(endpoint, self.inner.registry.clone(), sink, Role::Client);

        self.inner.dispatcher.reopen();
        *self.inner.handler.write().await = Some(handler.clone());
        self.inner.running.store(true, Ordering::SeqCst);
        *self.inner.state.write().await = ClientState::Connected;

        handler.start(None);
        tracing::info!("Connected to {}", server_addr);
        Ok(())
    }

    /// Connect to a server by hostname
    pub async fn connect_host(&self, hostname: &str, port: u16) -> ClientResult<()> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Wave bye-bye to the server and close the connection
    pub async fn stop(&self) -> ClientResult<()> {
        let handler = self
            .inner
            .handler
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        handler.say_goodbye().await;
        Ok(())
    }

    /// Send a message to the server
    pub async fn send<T: Encode + 'static>(&self, message: &T) -> ClientResult<()> {
        let handler = self
            .inner
            .handler
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        handler.send(message).await?;
        Ok(())
    }

    /// Context of the current connection, if any
    pub async fn context(&self) -> Option<Arc<ConnectionContext>> {
        self.inner
            .handler
            .read()
            .await
            .as_ref()
            .map(|h| h.context().clone())
    }

    /// Get the current state
    pub async fn state(&self) -> ClientState {
        *self.inner.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.inner.state.read().await == ClientState::Connected
    }

    /// Whether the connection is up and messages may still arrive
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn has_queued_messages(&self) -> bool {
        self.inner.dispatcher.has_queued()
    }

    /// Take the oldest queued message without waiting
    pub fn pull_next_message(&self) -> Option<Received<M>> {
        self.inner.dispatcher.pull()
    }

    /// Wait for the next queued message. Returns `None` once disconnected
    /// and drained.
    pub async fn next_message(&self) -> Option<Received<M>> {
        self.inner.dispatcher.next().await
    }
}

#[async_trait]
impl<M: Send + 'static> MessageSink<M> for ClientInner<M> {
    async fn deliver(&self, received: Received<M>) {
        self.dispatcher.dispatch(received).await;
    }

    async fn release(&self, context: &Arc<ConnectionContext>) {
        {
            let mut handler = self.handler.write().await;
            if handler.as_ref().map(|h| h.context().id()) == Some(context.id()) {
                *handler = None;
            }
        }
        *self.state.write().await = ClientState::Disconnected;
        self.running.store(false, Ordering::SeqCst);
        self.dispatcher.close();
        tracing::info!("Disconnected from {}", context.peer_addr());
    }
}
