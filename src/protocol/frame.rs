//! Line framing for messages
//!
//! A frame is the three-digit zero-padded message ID, the encoded payload,
//! and a terminating newline: `NNN<payload>\n`.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use super::{MessageId, MAX_MESSAGE_ID};

/// Frame terminator
pub const FRAME_DELIMITER: u8 = b'\n';

/// Width of the ID field
pub const ID_WIDTH: usize = 3;

/// Maximum accepted line length (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short for a message ID: {0:?}")]
    TooShort(String),

    #[error("Invalid message ID field: {0:?}")]
    InvalidId(String),

    #[error("Message ID {0} does not fit the ID field")]
    IdOutOfRange(MessageId),

    #[error("Payload contains a frame delimiter")]
    EmbeddedDelimiter,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),
}

/// One framed message: ID plus encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: MessageId,
    pub payload: String,
}

impl Frame {
    pub fn new(id: MessageId, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// A frame with no payload, as used by the control messages
    pub fn bare(id: MessageId) -> Self {
        Self::new(id, String::new())
    }

    /// Render as `NNN<payload>\n`
    pub fn encode(&self) -> Result<String, FrameError> {
        if self.id > MAX_MESSAGE_ID {
            return Err(FrameError::IdOutOfRange(self.id));
        }
        if self.payload.contains(FRAME_DELIMITER as char) {
            return Err(FrameError::EmbeddedDelimiter);
        }
        Ok(format!("{:03}{}\n", self.id, self.payload))
    }

    /// Parse one line. A trailing `\n` (and `\r`) is ignored.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let header = line.get(..ID_WIDTH).ok_or_else(|| FrameError::TooShort(line.to_string()))?;
        if !header.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FrameError::InvalidId(header.to_string()));
        }
        let id = header
            .parse::<MessageId>()
            .map_err(|_| FrameError::InvalidId(header.to_string()))?;

        Ok(Self::new(id, &line[ID_WIDTH..]))
    }
}

/// Splits a byte stream into newline-terminated lines.
///
/// Bytes that are not UTF-8 are replaced with U+FFFD so a garbled line still
/// reaches the registry and comes out as an invalid message.
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    max_size: usize,
    /// Skipping the rest of an oversized line
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_size,
            discarding: false,
        }
    }

    /// Buffer for the transport to read into
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete line without its terminator.
    /// Returns Ok(None) if more data is needed.
    ///
    /// A line longer than the size limit is reported once with
    /// `FrameTooLarge` and then skipped up to its terminator; decoding
    /// carries on with the line after it.
    pub fn decode(&mut self) -> Result<Option<String>, FrameError> {
        loop {
            let end = self.buf.iter().position(|b| *b == FRAME_DELIMITER);

            if self.discarding {
                match end {
                    Some(end) => {
                        self.buf.advance(end + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.buf.clear();
                        return Ok(None);
                    }
                }
            }

            return match end {
                Some(end) if end > self.max_size => {
                    self.buf.advance(end + 1);
                    Err(FrameError::FrameTooLarge(end, self.max_size))
                }
                Some(end) => {
                    let line = self.buf.split_to(end);
                    self.buf.advance(1);
                    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
                }
                None if self.buf.len() > self.max_size => {
                    let len = self.buf.len();
                    self.buf.clear();
                    self.discarding = true;
                    Err(FrameError::FrameTooLarge(len, self.max_size))
                }
                None => Ok(None),
            };
        }
    }

    /// Whatever is left after the stream has ended
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() || self.discarding {
            self.buf.clear();
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
