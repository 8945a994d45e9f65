//! World module - Fixed-rate simulation on top of the coordinators
//!
//! A [`WorldServer`] ticks at a configurable frame rate. Each tick executes
//! the client messages that arrive within the frame's time budget against
//! the world, then advances the world by exactly one frame. A
//! [`WorldClient`] executes server messages against its world as they come.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::network::{Client, ClientResult, Executable, Received, Server, ServerResult};

/// Frame rate used when none (or an invalid one) is given
pub const DEFAULT_FRAMES_PER_SECOND: f64 = 1.0;

/// State advanced by a world loop
pub trait WorldContext: Send + 'static {
    /// Called once before the first tick
    fn init(&mut self) {}

    /// Move the simulation forward by `delta_seconds`
    fn advance(&mut self, delta_seconds: f64);
}

/// Shared, runtime-adjustable frame rate
#[derive(Debug, Clone)]
pub struct FrameRate(Arc<AtomicU64>);

impl FrameRate {
    pub fn new(frames_per_second: f64) -> Self {
        let rate = Self(Arc::new(AtomicU64::new(DEFAULT_FRAMES_PER_SECOND.to_bits())));
        rate.set(frames_per_second);
        rate
    }

    /// Change the rate. Ignored (with a warning) unless positive, finite and
    /// slow enough that one frame still fits a `Duration`.
    pub fn set(&self, frames_per_second: f64) -> bool {
        if !frames_per_second.is_finite()
            || frames_per_second <= 0.0
            || Duration::try_from_secs_f64(1.0 / frames_per_second).is_err()
        {
            tracing::warn!("Ignoring invalid frame rate {}", frames_per_second);
            return false;
        }
        self.0.store(frames_per_second.to_bits(), Ordering::SeqCst);
        tracing::info!("Frames per second set to {}", frames_per_second);
        true
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn seconds_per_frame(&self) -> f64 {
        1.0 / self.get()
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.seconds_per_frame()).unwrap_or(Duration::MAX)
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new(DEFAULT_FRAMES_PER_SECOND)
    }
}

/// Latest deadline that is safe to add to `now` (about thirty years out)
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(86_400 * 365 * 30)
}

/// Execute a received message against the world, logging failures
fn execute_logged<W, M: Executable<W>>(received: Received<M>, world: &mut W) {
    let peer = received.context.peer_addr();
    if let Err(e) = received.execute(world) {
        tracing::warn!("Message from {} not executed: {}", peer, e);
    }
}

/// A server that drives a world at a fixed frame rate
pub struct WorldServer<W, M> {
    server: Server<M>,
    world: Arc<Mutex<W>>,
    frame_rate: FrameRate,
}

impl<W, M> WorldServer<W, M>
where
    W: WorldContext,
    M: Executable<W> + Send + 'static,
{
    pub fn new(server: Server<M>, world: W, frames_per_second: f64) -> Self {
        Self::with_frame_rate(server, world, FrameRate::new(frames_per_second))
    }

    /// Share an existing frame rate, e.g. one the world itself adjusts
    pub fn with_frame_rate(server: Server<M>, world: W, frame_rate: FrameRate) -> Self {
        Self {
            server,
            world: Arc::new(Mutex::new(world)),
            frame_rate,
        }
    }

    pub fn server(&self) -> &Server<M> {
        &self.server
    }

    /// Shared handle to the world, e.g. for execution contexts
    pub fn world(&self) -> Arc<Mutex<W>> {
        self.world.clone()
    }

    /// Shared handle to the frame rate
    pub fn frame_rate(&self) -> FrameRate {
        self.frame_rate.clone()
    }

    /// Takes effect at the next tick boundary
    pub fn set_frames_per_second(&self, frames_per_second: f64) -> bool {
        self.frame_rate.set(frames_per_second)
    }

    /// Initialize the world and start the server
    pub async fn start(&self) -> ServerResult<SocketAddr> {
        self.world.lock().await.init();
        self.server.start().await
    }

    /// Start, then tick until the server stops
    pub async fn run(&self) -> ServerResult<()> {
        self.start().await?;
        while self.server.is_running() {
            self.tick().await;
        }
        Ok(())
    }

    /// Run one frame. Returns the delta the world was advanced by.
    pub async fn tick(&self) -> f64 {
        let delta = self.frame_rate.seconds_per_frame();
        let now = Instant::now();
        let deadline = now
            .checked_add(self.frame_rate.frame_duration())
            .unwrap_or_else(|| far_future(now));

        loop {
            match tokio::time::timeout_at(deadline, self.server.next_message()).await {
                Ok(Some(received)) => {
                    let mut world = self.world.lock().await;
                    execute_logged(received, &mut *world);
                }
                // Stopped and drained
                Ok(None) => break,
                Err(_) => break,
            }
        }

        self.world.lock().await.advance(delta);
        delta
    }
}

/// A client that executes server messages against its world
pub struct WorldClient<W, M> {
    client: Client<M>,
    world: Arc<Mutex<W>>,
}

impl<W, M> WorldClient<W, M>
where
    W: WorldContext,
    M: Executable<W> + Send + 'static,
{
    pub fn new(client: Client<M>, world: W) -> Self {
        Self {
            client,
            world: Arc::new(Mutex::new(world)),
        }
    }

    pub fn client(&self) -> &Client<M> {
        &self.client
    }

    pub fn world(&self) -> Arc<Mutex<W>> {
        self.world.clone()
    }

    /// Initialize the world, connect, and process messages until disconnected
    pub async fn run(&self, server_addr: SocketAddr) -> ClientResult<()> {
        self.world.lock().await.init();
        self.client.connect(server_addr).await?;
        self.process().await;
        Ok(())
    }

    /// Execute queued messages until the connection ends
    pub async fn process(&self) {
        while let Some(received) = self.client.next_message().await {
            let mut world = self.world.lock().await;
            execute_logged(received, &mut *world);
        }
        tracing::debug!("World client finished processing");
    }
}
