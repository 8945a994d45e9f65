//! SwiftSocket - Typed message exchange over TCP or UDP
//!
//! A server and any number of clients exchange ID-tagged messages encoded
//! with a length-prefixed text codec. The datagram transport emulates
//! connections with a `CONNECT`/`ACK` handshake, and an optional world loop
//! drives a simulation at a fixed frame rate.

pub mod config;
pub mod network;
pub mod protocol;
pub mod transport;
pub mod world;

pub use network::{
    Client, ClientError, ClientResult, ConnectionContext, Executable, ExecuteError, Inbound,
    KeepAliveSettings, NetworkConfig, Received, Server, ServerError, ServerResult,
};
pub use protocol::{Decode, Decoder, Encode, Encoder, MessageId};
pub use transport::TransportKind;
pub use world::{FrameRate, WorldClient, WorldContext, WorldServer};
