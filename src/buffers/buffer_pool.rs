use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace, warn};

use crate::buffers::byte_stream::ByteStream;
use crate::buffers::BufferError;

/// A free-list of [ByteStream]s with a standard capacity. If the pool runs dry, new buffers are
///  allocated on demand; the number of such allocations is counted as a capacity planning signal.
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<ByteStream>>,
    num_overflow_allocations: AtomicU64,
}

impl BufferPool {
    /// `initial_pool_size` buffers are allocated up front, and at most `max_pool_size` buffers
    ///  are retained when they are returned
    pub fn new(buf_size: usize, initial_pool_size: usize, max_pool_size: usize) -> BufferPool {
        let mut buffers = Vec::with_capacity(max_pool_size.max(initial_pool_size));
        for _ in 0..initial_pool_size.min(max_pool_size) {
            let mut buffer = ByteStream::new(buf_size);
            buffer.is_released = true;
            buffers.push(buffer);
        }

        BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(buffers),
            num_overflow_allocations: AtomicU64::new(0),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ByteStream>> {
        // the free-list is valid after any panic while holding the lock
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> ByteStream {
        let pooled = self.lock().pop();

        match pooled {
            Some(mut buffer) => {
                trace!("returning buffer from pool");
                if buffer.write_position() != 0 || buffer.bytes_written() != 0 || buffer.position() != 0 {
                    error!("pooled buffer is not empty - position {}, bytes written {}. Maybe it was modified after being released?", buffer.position(), buffer.bytes_written());
                    buffer.end_write();
                }
                buffer.is_released = false;
                buffer
            }
            None => {
                let num_overflow = self.num_overflow_allocations.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("no buffer in pool: allocating a new buffer ({} allocations beyond the pool so far)", num_overflow);
                ByteStream::new(self.buf_size)
            }
        }
    }

    pub fn release(&self, mut buffer: ByteStream) -> Result<(), BufferError> {
        if buffer.is_released {
            error!("the buffer is already released");
            return Err(BufferError::DoubleRelease);
        }
        if buffer.capacity() != self.buf_size {
            warn!("returned buffer has a capacity of {} rather than the pool's {} bytes - discarding it", buffer.capacity(), self.buf_size);
            return Err(BufferError::CapacityMismatch { expected: self.buf_size, actual: buffer.capacity() });
        }

        buffer.end_write();
        buffer.is_released = true;

        let mut buffers = self.lock();
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
        Ok(())
    }

    /// Returns a buffer to the pool where the caller has no use for a failure beyond the log
    ///  entry that [BufferPool::release] already wrote
    pub(crate) fn recycle(&self, buffer: ByteStream) {
        let _ = self.release(buffer);
    }

    pub fn num_pooled(&self) -> usize {
        self.lock().len()
    }

    pub fn num_overflow_allocations(&self) -> u64 {
        self.num_overflow_allocations.load(Ordering::Relaxed)
    }
}
