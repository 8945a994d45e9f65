//! Message identifiers and the built-in control messages
//!
//! Every frame carries a three-digit decimal ID. The two highest IDs are
//! reserved for the engine's own control traffic.

use super::ProtocolError;
use std::fmt;

/// Numeric message type identifier, `0..=999` on the wire
pub type MessageId = u16;

/// Keep-alive probe and its answer share one ID
pub const MESSAGE_ID_PINGPONG: MessageId = 999;

/// Graceful disconnect notice
pub const MESSAGE_ID_BYEBYE: MessageId = 998;

/// Highest ID that fits the three-digit wire field
pub const MAX_MESSAGE_ID: MessageId = 999;

/// Whether `id` belongs to a control message
pub fn is_reserved(id: MessageId) -> bool {
    id == MESSAGE_ID_PINGPONG || id == MESSAGE_ID_BYEBYE
}

/// Check that `id` may be registered for an application message
pub fn validate_user_id(id: MessageId) -> Result<(), ProtocolError> {
    if id > MAX_MESSAGE_ID {
        Err(ProtocolError::IdOutOfRange(id))
    } else if is_reserved(id) {
        Err(ProtocolError::ReservedId(id))
    } else {
        Ok(())
    }
}

/// Body-less messages handled by the connection itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Ping from the server, pong from the client
    PingPong,
    /// The sender is leaving; no further messages follow
    ByeBye,
}

impl ControlMessage {
    pub fn id(&self) -> MessageId {
        match self {
            ControlMessage::PingPong => MESSAGE_ID_PINGPONG,
            ControlMessage::ByeBye => MESSAGE_ID_BYEBYE,
        }
    }

    pub fn from_id(id: MessageId) -> Option<Self> {
        match id {
            MESSAGE_ID_PINGPONG => Some(ControlMessage::PingPong),
            MESSAGE_ID_BYEBYE => Some(ControlMessage::ByeBye),
            _ => None,
        }
    }
}

/// Which table of a registry an ID was registered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// A received frame that could not be turned into a message.
///
/// Invalid messages still travel through the queue so the failure surfaces
/// when the application executes them.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    /// The ID, if the frame header could be read
    pub id: Option<MessageId>,
    /// The raw line as received
    pub raw: String,
    /// Why decoding failed
    pub cause: ProtocolError,
}

impl InvalidMessage {
    pub fn new(id: Option<MessageId>, raw: impl Into<String>, cause: ProtocolError) -> Self {
        Self {
            id,
            raw: raw.into(),
            cause,
        }
    }
}

impl fmt::Display for InvalidMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "invalid message {:03} ({}): {:?}", id, self.cause, self.raw),
            None => write!(f, "invalid message ({}): {:?}", self.cause, self.raw),
        }
    }
}
