//! Demo applications built on the library
//!
//! - `chat`: a line relay between clients
//! - `clock`: a world server broadcasting the time of day

pub mod chat;
pub mod clock;
