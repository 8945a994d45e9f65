//! Network module - Coordinates message exchange between server and clients
//!
//! Provides:
//! - Server for accepting peers over either transport
//! - Client for connecting to servers
//! - Per-connection handling, keep-alive and the inbound message queue

mod client;
mod connection;
mod context;
mod dispatch;
mod server;

pub use client::*;
pub use connection::*;
pub use context::*;
pub use dispatch::*;
pub use server::*;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::transport::TransportKind;

/// Default keep-alive ping interval in milliseconds
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 2500;

/// Default keep-alive pong timeout in milliseconds
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_MS: u64 = 5000;

/// Keep-alive switch and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            timeout_ms: DEFAULT_KEEP_ALIVE_TIMEOUT_MS,
        }
    }
}

impl KeepAliveSettings {
    pub fn enabled(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            enabled: true,
            interval_ms,
            timeout_ms,
        }
    }

    /// Timing for a new connection, if keep-alive is on
    pub fn keep_alive(&self) -> Option<KeepAlive> {
        self.enabled.then(|| KeepAlive {
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }
}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Stream or datagram
    pub transport: TransportKind,
    /// Interface to listen on
    pub bind_address: IpAddr,
    /// Port to listen on or connect to
    pub port: u16,
    /// Connection (and datagram handshake) timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Server-side ping settings
    pub keep_alive: KeepAliveSettings,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stream,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: crate::protocol::DEFAULT_PORT,
            connect_timeout_ms: 5000,
            keep_alive: KeepAliveSettings::default(),
        }
    }
}

impl NetworkConfig {
    pub fn new(transport: TransportKind, port: u16) -> Self {
        Self {
            transport,
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn with_keep_alive(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.keep_alive = KeepAliveSettings::enabled(interval_ms, timeout_ms);
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive.enabled = false;
        self
    }

    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl From<&crate::config::Config> for NetworkConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            transport: config.network.transport,
            bind_address: config.network.bind_address,
            port: config.network.port,
            connect_timeout_ms: config.network.connect_timeout_ms,
            keep_alive: KeepAliveSettings {
                enabled: config.keep_alive.enabled,
                interval_ms: config.keep_alive.interval_ms,
                timeout_ms: config.keep_alive.timeout_ms,
            },
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
