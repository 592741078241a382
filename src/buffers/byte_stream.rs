//! A fixed-capacity byte buffer with separate read and write cursors. All numbers are encoded
//!  little-endian.
//!
//! `ByteStream` implements `Buf` for its read side and `BufMut` for its write side to fit into
//!  the `bytes` ecosystem. The inherent `write_*` and `read_*` functions add the buffer's own
//!  guarantees on top of that:
//!
//! * Writes are all-or-nothing: if a value does not fit into the remaining capacity, an error is
//!   logged and returned, and the buffer is left unchanged.
//! * Reads never fail: reading past the written data logs an error and returns zero, so callers
//!   that need to distinguish a legitimate zero from exhausted data use `Buf::try_get_*`
//!   instead.

use bytes::buf::UninitSlice;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};
use std::mem::size_of;
use tokio::time::Instant;
use tracing::error;

use crate::buffers::BufferError;
use crate::channel::MessageType;

macro_rules! write_impl {
    ($writer: ident, $put: ident, $ty: ty) => {
        pub fn $writer(&mut self, value: $ty) -> Result<(), BufferError> {
            self.check_space(size_of::<$ty>())?;
            self.$put(value);
            Ok(())
        }
    }
}

macro_rules! read_impl {
    ($reader: ident, $try_get: ident, $ty: ty) => {
        pub fn $reader(&mut self) -> $ty {
            self.$try_get().unwrap_or_else(|e| {
                error!("buffer underflow - {}", e);
                0
            })
        }
    }
}

pub struct ByteStream {
    buf: Box<[u8]>,
    write_cursor: usize,
    read_cursor: usize,
    bytes_written: usize,
    /// set for buffers holding a complete datagram, i.e. including the frame header
    is_raw_bytes: bool,
    last_write_time: Option<Instant>,
    pub(crate) is_released: bool,
}

impl ByteStream {
    pub fn new(capacity: usize) -> ByteStream {
        ByteStream {
            buf: vec![0; capacity].into_boxed_slice(),
            write_cursor: 0,
            read_cursor: 0,
            bytes_written: 0,
            is_raw_bytes: false,
            last_write_time: None,
            is_released: false,
        }
    }

    /// This is a convenience function for test code: a buffer with the given capacity,
    ///  pre-filled with `data`
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> ByteStream {
        let mut result = ByteStream::new(capacity);
        result.write_slice(data).expect("test data exceeds the buffer's capacity");
        result
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn write_position(&self) -> usize {
        self.write_cursor
    }

    /// the read cursor
    pub fn position(&self) -> usize {
        self.read_cursor
    }

    /// Moves the read cursor, e.g. to re-read data from the start. Positions after the end of
    ///  the written data are refused.
    pub fn set_position(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.bytes_written {
            error!("cannot move read position to {}, only {} bytes were written", position, self.bytes_written);
            return Err(BufferError::InvalidRange { offset: position, len: 0, source_len: self.bytes_written });
        }
        self.read_cursor = position;
        Ok(())
    }

    pub fn bytes_remaining(&self) -> usize {
        self.bytes_written - self.read_cursor
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_written == 0
    }

    /// everything that was written so far, regardless of the read cursor
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.bytes_written]
    }

    /// the data between read cursor and the end of the written data
    pub fn remaining_slice(&self) -> &[u8] {
        &self.buf[self.read_cursor..self.bytes_written]
    }

    pub fn is_raw_bytes(&self) -> bool {
        self.is_raw_bytes
    }

    pub fn set_raw_bytes(&mut self, is_raw_bytes: bool) {
        self.is_raw_bytes = is_raw_bytes;
    }

    pub fn last_write_time(&self) -> Option<Instant> {
        self.last_write_time
    }

    pub fn set_last_write_time(&mut self) {
        self.set_last_write_time_to(Instant::now());
    }

    pub(crate) fn set_last_write_time_to(&mut self, at: Instant) {
        self.last_write_time = Some(at);
    }

    fn check_space(&self, size: usize) -> Result<(), BufferError> {
        let available = self.capacity() - self.write_cursor;
        if size > available {
            error!("buffer overflow - not enough space to write {} bytes, {} available", size, available);
            return Err(BufferError::Overflow { requested: size, available });
        }
        Ok(())
    }

    pub fn write_slice(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.check_space(data.len())?;
        self.put_slice(data);
        Ok(())
    }

    /// copies `len` bytes of `data`, starting at `offset`
    pub fn write_range(&mut self, data: &[u8], offset: usize, len: usize) -> Result<(), BufferError> {
        match offset.checked_add(len) {
            Some(end) if end <= data.len() => self.write_slice(&data[offset..end]),
            _ => {
                error!("cannot copy {} bytes at offset {} from a source of {} bytes", len, offset, data.len());
                Err(BufferError::InvalidRange { offset, len, source_len: data.len() })
            }
        }
    }

    /// copies the written range of another buffer, independently of its read cursor
    pub fn write_buffer(&mut self, other: &ByteStream) -> Result<(), BufferError> {
        self.write_slice(other.as_slice())
    }

    /// The message type tag is the first byte of every logical message, so it can only be
    ///  written into an empty buffer
    pub fn write_message_type(&mut self, message_type: MessageType) -> Result<(), BufferError> {
        if self.write_cursor != 0 || self.bytes_written != 0 {
            error!("the buffer is not empty: position {}, bytes written {}", self.write_cursor, self.bytes_written);
            return Err(BufferError::NotEmpty { bytes_written: self.bytes_written });
        }
        self.write_u8(message_type.0)
    }

    write_impl!(write_u8, put_u8, u8);
    write_impl!(write_i8, put_i8, i8);
    write_impl!(write_u16, put_u16_le, u16);
    write_impl!(write_i16, put_i16_le, i16);
    write_impl!(write_u32, put_u32_le, u32);
    write_impl!(write_i32, put_i32_le, i32);
    write_impl!(write_u64, put_u64_le, u64);
    write_impl!(write_i64, put_i64_le, i64);

    read_impl!(read_u8, try_get_u8, u8);
    read_impl!(read_i8, try_get_i8, i8);
    read_impl!(read_u16, try_get_u16_le, u16);
    read_impl!(read_i16, try_get_i16_le, i16);
    read_impl!(read_u32, try_get_u32_le, u32);
    read_impl!(read_i32, try_get_i32_le, i32);
    read_impl!(read_u64, try_get_u64_le, u64);
    read_impl!(read_i64, try_get_i64_le, i64);

    pub fn read_message_type(&mut self) -> MessageType {
        MessageType(self.read_u8())
    }

    /// Returns the next `len` bytes and advances the read cursor past them, or `None` if fewer
    ///  bytes are left
    pub fn read_range(&mut self, len: usize) -> Option<&[u8]> {
        if len > self.bytes_remaining() {
            error!("buffer underflow - not enough data to read {} bytes, {} remaining", len, self.bytes_remaining());
            return None;
        }
        let start = self.read_cursor;
        self.read_cursor += len;
        Some(&self.buf[start..self.read_cursor])
    }

    /// resets all cursors and flags, making the buffer's entire capacity available for writing
    pub fn end_write(&mut self) {
        self.write_cursor = 0;
        self.read_cursor = 0;
        self.bytes_written = 0;
        self.is_raw_bytes = false;
        self.is_released = false;
    }
}

impl Buf for ByteStream {
    fn remaining(&self) -> usize {
        self.bytes_remaining()
    }

    fn chunk(&self) -> &[u8] {
        self.remaining_slice()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.bytes_remaining());
        self.read_cursor += cnt;
    }
}

unsafe impl BufMut for ByteStream {
    fn remaining_mut(&self) -> usize {
        self.capacity() - self.write_cursor
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.write_cursor + cnt <= self.capacity());
        self.write_cursor += cnt;
        self.bytes_written = self.bytes_written.max(self.write_cursor);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.write_cursor..])
    }
}

impl PartialEq for ByteStream {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice().eq(other.as_slice())
    }
}

impl Debug for ByteStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_slice().fmt(f)
    }
}

impl AsRef<[u8]> for ByteStream {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
