//! Crate-wide error type.
//!
//! Primitives report partial progress through their `Ok` count (a timed-out
//! send that moved 40 of 100 bytes returns `Ok(40)`); `Error` is reserved
//! for conditions with no useful count.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller passed something unusable: negative fd, zero-cycle periodic,
    /// unknown signal number, commit larger than the reservation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Arithmetic or capacity overflow: buffer limit breach, time
    /// subtraction going negative.
    #[error("overflow")]
    Overflow,

    /// The resource is already in use: nested `run`, second direct-access
    /// lock, duplicate fd registration.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// Kernel said no for a reason other than interruption.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The peer closed or a timeout hit in the middle of a framed read.
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    /// Wire bytes that do not parse as a message.
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for wrapping the current `errno`.
    pub(crate) fn last_os() -> Error {
        Error::Io(io::Error::last_os_error())
    }
}
