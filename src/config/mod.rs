//! Configuration module
//!
//! Handles loading and saving SwiftSocket configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{DEFAULT_KEEP_ALIVE_INTERVAL_MS, DEFAULT_KEEP_ALIVE_TIMEOUT_MS};
use crate::protocol::DEFAULT_PORT;
use crate::transport::TransportKind;
use crate::world::DEFAULT_FRAMES_PER_SECOND;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Keep-alive settings
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    /// World loop settings
    #[serde(default)]
    pub world: WorldConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name shown to peers (chat nickname)
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    "anonymous".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Stream (TCP) or datagram (UDP)
    #[serde(default)]
    pub transport: TransportKind,
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Connection timeout in ms (also bounds the datagram handshake)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            port: default_port(),
            bind_address: default_bind_address(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Keep-alive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Ping clients and drop the silent ones
    #[serde(default)]
    pub enabled: bool,
    /// Time between pings in ms
    #[serde(default = "default_keep_alive_interval")]
    pub interval_ms: u64,
    /// Time to wait for a pong in ms
    #[serde(default = "default_keep_alive_timeout")]
    pub timeout_ms: u64,
}

fn default_keep_alive_interval() -> u64 {
    DEFAULT_KEEP_ALIVE_INTERVAL_MS
}

fn default_keep_alive_timeout() -> u64 {
    DEFAULT_KEEP_ALIVE_TIMEOUT_MS
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_keep_alive_interval(),
            timeout_ms: default_keep_alive_timeout(),
        }
    }
}

/// World loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Ticks per second
    #[serde(default = "default_frames_per_second")]
    pub frames_per_second: f64,
}

fn default_frames_per_second() -> f64 {
    DEFAULT_FRAMES_PER_SECOND
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            frames_per_second: default_frames_per_second(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("swiftsocket/config.toml")),
            Some(PathBuf::from("./swiftsocket.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "alice".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            transport: TransportKind::Datagram,
            ..Default::default()
        },
        keep_alive: KeepAliveConfig {
            enabled: true,
            ..Default::default()
        },
        world: WorldConfig {
            frames_per_second: 4.0,
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
