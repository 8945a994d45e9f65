//! Per-connection context shared between the handler and the application

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::transport::{Transport, TransportKind};

type SessionStore = HashMap<String, Box<dyn Any + Send + Sync>>;

/// State of one logical connection.
///
/// Outlives the transport: the peer address and session data stay readable
/// after the connection has been disposed.
pub struct ConnectionContext {
    id: Uuid,
    peer: SocketAddr,
    transport: Option<Arc<dyn Transport>>,
    said_goodbye: AtomicBool,
    last_ping: Mutex<Option<Instant>>,
    pong_received: AtomicBool,
    pong_signal: Notify,
    session: Mutex<SessionStore>,
}

impl ConnectionContext {
    /// Context for a live transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::build(transport.peer_addr(), Some(transport))
    }

    /// Context without a transport, used to report packets from peers that
    /// never completed the handshake. Always inactive.
    pub fn detached(peer: SocketAddr) -> Self {
        Self::build(peer, None)
    }

    fn build(peer: SocketAddr, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            transport,
            said_goodbye: AtomicBool::new(false),
            last_ping: Mutex::new(None),
            pong_received: AtomicBool::new(false),
            pong_signal: Notify::new(),
            session: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.as_ref().map(|t| t.kind())
    }

    pub fn is_detached(&self) -> bool {
        self.transport.is_none()
    }

    /// Whether messages can still be exchanged with this peer
    pub fn is_active(&self) -> bool {
        match &self.transport {
            Some(transport) => !self.said_goodbye() && !transport.is_closed(),
            None => false,
        }
    }

    pub fn said_goodbye(&self) -> bool {
        self.said_goodbye.load(Ordering::SeqCst)
    }

    /// Mark the peer as gone. Returns whether it was already marked.
    pub fn mark_goodbye(&self) -> bool {
        self.said_goodbye.swap(true, Ordering::SeqCst)
    }

    /// Time the last ping was sent, if any
    pub fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an outgoing ping and clear the pong flag
    pub fn record_ping(&self) {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.pong_received.store(false, Ordering::SeqCst);
    }

    /// Record an incoming pong
    pub fn mark_pong(&self) {
        self.pong_received.store(true, Ordering::SeqCst);
        self.pong_signal.notify_waiters();
    }

    pub fn pong_received(&self) -> bool {
        self.pong_received.load(Ordering::SeqCst)
    }

    /// Wait until a pong has been recorded since the last ping
    pub async fn wait_for_pong(&self) {
        loop {
            let notified = self.pong_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pong_received() {
                return;
            }
            notified.await;
        }
    }

    /// Store an application value under `key`, replacing any previous one
    pub fn set_value<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.session_store().insert(key.into(), Box::new(value));
    }

    /// Copy of the value under `key`, if present and of type `T`
    pub fn value<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.session_store()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn has_value(&self, key: &str) -> bool {
        self.session_store().contains_key(key)
    }

    /// Remove the value under `key`; returns whether one was present
    pub fn remove_value(&self, key: &str) -> bool {
        self.session_store().remove(key).is_some()
    }

    fn session_store(&self) -> std::sync::MutexGuard<'_, SessionStore> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("kind", &self.transport_kind())
            .field("said_goodbye", &self.said_goodbye())
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detached() -> ConnectionContext {
        ConnectionContext::detached("127.0.0.1:4000".parse().unwrap())
    }

    #[test]
    fn test_detached_context_is_inactive() {
        let context = detached();
        assert!(context.is_detached());
        assert!(!context.is_active());
        assert_eq!(context.peer_addr().port(), 4000);
        assert_eq!(context.transport_kind(), None);
    }

    #[test]
    fn test_goodbye_flag() {
        let context = detached();
        assert!(!context.said_goodbye());
        assert!(!context.mark_goodbye());
        assert!(context.mark_goodbye());
        assert!(context.said_goodbye());
    }

    #[test]
    fn test_session_values() {
        let context = detached();
        context.set_value("name", "alice".to_string());
        context.set_value("score", 7u32);

        assert_eq!(context.value::<String>("name").as_deref(), Some("alice"));
        assert_eq!(context.value::<u32>("score"), Some(7));
        assert_eq!(context.value::<i64>("score"), None);
        assert!(context.remove_value("name"));
        assert!(!context.has_value("name"));
    }

    #[tokio::test]
    async fn test_pong_wakes_waiter() {
        let context = Arc::new(detached());
        context.record_ping();
        assert!(context.last_ping().is_some());
        assert!(!context.pong_received());

        let waiter = {
            let context = context.clone();
            tokio::spawn(async move { context.wait_for_pong().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        context.mark_pong();

        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        // A pong recorded before waiting is not lost
        context.record_ping();
        context.mark_pong();
        tokio::time::timeout(Duration::from_millis(100), context.wait_for_pong())
            .await
            .unwrap();
    }
}
