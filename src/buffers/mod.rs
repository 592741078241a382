//! Fixed-capacity byte buffers and the pool they are recycled through.
//!
//! Every datagram the transport sends or receives passes through a [byte_stream::ByteStream]
//!  that is taken from a [buffer_pool::BufferPool] and returned to it afterwards, so steady-state
//!  operation does not allocate per message.

pub mod buffer_pool;
pub mod byte_stream;

use std::fmt::{Display, Formatter};

/// Misuse of a buffer or of the pool. These are programming errors on the caller's side rather
///  than network conditions, and they never leave a buffer partially modified.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufferError {
    /// a write did not fit into the remaining capacity
    Overflow { requested: usize, available: usize },
    /// a range was requested that lies outside of the source slice
    InvalidRange { offset: usize, len: usize, source_len: usize },
    /// the message type tag must be the first thing written into a buffer
    NotEmpty { bytes_written: usize },
    /// the buffer was returned to the pool while it was already there
    DoubleRelease,
    /// the buffer does not have the pool's standard capacity
    CapacityMismatch { expected: usize, actual: usize },
}

impl Display for BufferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Overflow { requested, available } =>
                write!(f, "buffer overflow - not enough space: requested {} bytes, {} available", requested, available),
            BufferError::InvalidRange { offset, len, source_len } =>
                write!(f, "range {}..{} is outside of a source with {} bytes", offset, offset + len, source_len),
            BufferError::NotEmpty { bytes_written } =>
                write!(f, "buffer is not empty: {} bytes written", bytes_written),
            BufferError::DoubleRelease =>
                write!(f, "buffer is already released"),
            BufferError::CapacityMismatch { expected, actual } =>
                write!(f, "buffer capacity {} does not match the pool's buffer size {}", actual, expected),
        }
    }
}

impl std::error::Error for BufferError {}
