//! Inbound message queue and direct execution
//!
//! Every decoded message (or invalid sentinel) of a coordinator flows through
//! one [`Dispatcher`]. Messages whose ID has an execution context registered
//! run immediately on the connection's read task; all others are queued in
//! arrival order until the application pulls them.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Notify;

use super::ConnectionContext;
use crate::protocol::{InvalidMessage, MessageId, ProtocolError};

/// Errors from executing a received message
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("Invalid message from {peer}: {source}")]
    Invalid {
        peer: SocketAddr,
        raw: String,
        #[source]
        source: ProtocolError,
    },

    #[error("Message {id:03} from {peer} failed: {source}")]
    Failed {
        id: MessageId,
        peer: SocketAddr,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A message that can act on a target of type `W`
pub trait Executable<W> {
    fn execute(self, origin: &Arc<ConnectionContext>, target: &mut W) -> anyhow::Result<()>;
}

/// Payload of a received message
#[derive(Debug)]
pub enum Inbound<M> {
    Message { id: MessageId, body: M },
    Invalid(InvalidMessage),
}

/// A received message together with the connection it came from
#[derive(Debug)]
pub struct Received<M> {
    pub context: Arc<ConnectionContext>,
    pub message: Inbound<M>,
}

impl<M> Received<M> {
    pub fn message(context: Arc<ConnectionContext>, id: MessageId, body: M) -> Self {
        Self {
            context,
            message: Inbound::Message { id, body },
        }
    }

    pub fn invalid(context: Arc<ConnectionContext>, invalid: InvalidMessage) -> Self {
        Self {
            context,
            message: Inbound::Invalid(invalid),
        }
    }

    /// The message ID, if the frame header could be read
    pub fn id(&self) -> Option<MessageId> {
        match &self.message {
            Inbound::Message { id, .. } => Some(*id),
            Inbound::Invalid(invalid) => invalid.id,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.message, Inbound::Invalid(_))
    }

    /// Unwrap a valid message body, turning an invalid one into its error
    pub fn into_body(self) -> Result<(Arc<ConnectionContext>, M), ExecuteError> {
        match self.message {
            Inbound::Message { body, .. } => Ok((self.context, body)),
            Inbound::Invalid(invalid) => Err(ExecuteError::Invalid {
                peer: self.context.peer_addr(),
                raw: invalid.raw,
                source: invalid.cause,
            }),
        }
    }

    /// Run the message against `target`
    pub fn execute<W>(self, target: &mut W) -> Result<(), ExecuteError>
    where
        M: Executable<W>,
    {
        let id = self.id().unwrap_or_default();
        let (context, body) = self.into_body()?;
        body.execute(&context, target).map_err(|e| ExecuteError::Failed {
            id,
            peer: context.peer_addr(),
            source: e.into(),
        })
    }
}

/// Executes a message immediately instead of queueing it
pub type DirectExecutor<M> =
    Arc<dyn Fn(Received<M>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Inbound FIFO plus the direct-execution table
pub struct Dispatcher<M> {
    queue: Mutex<VecDeque<Received<M>>>,
    available: Notify,
    closed: AtomicBool,
    executors: RwLock<HashMap<MessageId, DirectExecutor<M>>>,
}

impl<M: Send + 'static> Dispatcher<M> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Execute messages with `id` against `target` as they arrive
    pub fn register_execution_context<W>(&self, id: MessageId, target: Arc<tokio::sync::Mutex<W>>)
    where
        W: Send + 'static,
        M: Executable<W>,
    {
        let executor: DirectExecutor<M> = Arc::new(move |received: Received<M>| {
            let target = target.clone();
            Box::pin(async move {
                let mut target = target.lock().await;
                if let Err(e) = received.execute(&mut *target) {
                    tracing::warn!("Direct execution failed: {}", e);
                }
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        self.executors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, executor);
    }

    pub fn has_execution_context(&self, id: MessageId) -> bool {
        self.executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Route one received message
    pub async fn dispatch(&self, received: Received<M>) {
        let executor = received.id().and_then(|id| {
            self.executors
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .cloned()
        });

        match executor {
            Some(executor) => executor(received).await,
            None => {
                self.lock_queue().push_back(received);
                self.available.notify_one();
            }
        }
    }

    pub fn has_queued(&self) -> bool {
        !self.lock_queue().is_empty()
    }

    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    /// Take the oldest queued message without waiting
    pub fn pull(&self) -> Option<Received<M>> {
        self.lock_queue().pop_front()
    }

    /// Wait for the next queued message. Returns `None` once the dispatcher
    /// is closed and drained.
    pub async fn next(&self) -> Option<Received<M>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(received) = self.pull() {
                return Some(received);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Stop waiting consumers once the queue runs dry
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Received<M>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: Send + 'static> Default for Dispatcher<M> {
    fn default() -> Self {
        Self::new()
    }
}
