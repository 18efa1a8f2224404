//! Wire framing for the hwio remoting protocol (C1 in the design doc).
//!
//! A frame is a fixed-size [`Header`] optionally followed by a
//! command-specific body. Everything is host-endian (native-endian): both
//! ends of the wire are assumed to agree, cross-endian interop is an
//! explicit non-goal. This crate performs no I/O; see `hwio-transport` for
//! that.

mod command;
mod error_code;
mod header;
mod records;

pub use command::Command;
pub use error_code::ErrorCode;
pub use header::{Header, HEADER_SIZE};
pub use records::{DevQueryItem, ErrMsg, ReadReq, WriteReqHeader};

/// Maximum bytes allowed in a frame body. Any `body_len` above this is
/// rejected by [`Header::decode`] before the caller even attempts to read
/// the body.
pub const BUFFER_SIZE: usize = 8192;

/// Upper bound on the number of [`DevQueryItem`] entries in a single QUERY.
pub const MAX_ITEMS_PER_QUERY: usize = 32;

/// Fixed width of any null-terminated name/message field on the wire.
pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("body_len {0} exceeds BUFFER_SIZE - HEADER_SIZE ({1})")]
    BodyTooLarge(u16, usize),
    #[error("unknown command code {0}")]
    UnknownCommand(u16),
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("string does not fit in {0}-byte field")]
    NameTooLong(usize),
}
