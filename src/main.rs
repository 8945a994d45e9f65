//! SwiftSocket - Typed message exchange over TCP or UDP
//!
//! Command line front end running the chat and clock demos.

mod demo;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use swiftsocket::config::{self, Config};
use swiftsocket::network::resolve_host;
use swiftsocket::{KeepAliveSettings, NetworkConfig, TransportKind};

/// SwiftSocket - Typed message exchange over TCP or UDP
#[derive(Parser)]
#[command(name = "swiftsocket")]
#[command(author = "SwiftSocket Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Exchange typed messages over TCP or UDP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Transport to use: stream (tcp) or datagram (udp)
    #[arg(short, long, global = true)]
    transport: Option<TransportKind>,

    /// Ping clients and drop the ones that stop answering
    #[arg(long, global = true)]
    keep_alive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat relay
    ChatServer {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Join a chat relay
    ChatClient {
        /// Server address (host or host:port)
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Nickname shown to others
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Run the clock world server
    ClockServer {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Ticks per second
        #[arg(long)]
        fps: Option<f64>,
    },

    /// Watch a clock world server
    ClockClient {
        /// Server address (host or host:port)
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::ChatServer { port } => {
            let net = network_config(&config, cli.transport, port, cli.keep_alive);
            demo::chat::run_server(net).await?;
        }
        Commands::ChatClient { server, port, name } => {
            let net = network_config(&config, cli.transport, port, false);
            let addr = server_address(&server, net.port).await?;
            let name = name.unwrap_or_else(|| config.general.name.clone());
            demo::chat::run_client(net, addr, name).await?;
        }
        Commands::ClockServer { port, fps } => {
            let net = network_config(&config, cli.transport, port, cli.keep_alive);
            let fps = fps.unwrap_or(config.world.frames_per_second);
            demo::clock::run_server(net, fps).await?;
        }
        Commands::ClockClient { server, port } => {
            let net = network_config(&config, cli.transport, port, false);
            let addr = server_address(&server, net.port).await?;
            demo::clock::run_client(net, addr).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Merge the config file with command line overrides
fn network_config(
    config: &Config,
    transport: Option<TransportKind>,
    port: Option<u16>,
    keep_alive: bool,
) -> NetworkConfig {
    let mut net = NetworkConfig::from(config);
    if let Some(transport) = transport {
        net.transport = transport;
    }
    if let Some(port) = port {
        net.port = port;
    }
    if keep_alive && !net.keep_alive.enabled {
        net.keep_alive = KeepAliveSettings::enabled(
            config.keep_alive.interval_ms,
            config.keep_alive.timeout_ms,
        );
    }
    net
}

/// Accept `host`, `ip` or `ip:port`
async fn server_address(server: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    Ok(resolve_host(server, port).await?)
}
