//! Protocol module - Defines the wire protocol for SwiftSocket communication
//!
//! The protocol is line based text:
//! - 3 decimal digits message ID, zero padded
//! - Encoded payload (see [`codec`])
//! - `\n` terminator
//!
//! IDs 999 (ping/pong) and 998 (bye-bye) are reserved for control messages.

pub mod codec;
mod frame;
mod message;
mod registry;

pub use codec::{CodecError, CodecResult, Decode, Decoder, Encode, Encoder};
pub use frame::*;
pub use message::*;
pub use registry::*;

use thiserror::Error;

/// Default port for SwiftSocket communication
pub const DEFAULT_PORT: u16 = 4444;

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Unknown message ID: {0:03}")]
    UnknownMessageId(MessageId),

    #[error("Control message {id:03} must not carry a body, got {body:?}")]
    ControlBody { id: MessageId, body: String },

    #[error("Handshake failed: expected {expected:?}, received {received:?}")]
    Handshake { expected: String, received: String },

    #[error("Message ID {0:03} is reserved for control messages")]
    ReservedId(MessageId),

    #[error("Message ID {0} is out of range (max: 999)")]
    IdOutOfRange(MessageId),

    #[error("Message ID {id:03} is already registered as {direction}")]
    AlreadyRegistered { id: MessageId, direction: Direction },

    #[error("Type {0} is not registered for sending")]
    UnregisteredType(&'static str),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
