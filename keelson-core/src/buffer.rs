//! Pooled chained byte buffer.
//!
//! A [`Buffer`] is a queue of fixed-size chunks borrowed from a shared
//! [`BufferPool`]. It offers two access modes:
//!
//! - **Byte-stream**: [`Buffer::write`] / [`Buffer::read`] copy bytes in and
//!   out, allocating and recycling chunks as cursors move.
//! - **Zero-copy**: [`Buffer::begin_write`] reserves the spare region of the
//!   tail chunk so a socket can read straight into it, and
//!   [`Buffer::begin_read`] exposes the readable region of the head chunk so
//!   a socket can write straight out of it.
//!
//! Only one reservation of each kind may be outstanding at a time; while one
//! is active the corresponding byte-stream calls fail. A drained head chunk
//! is kept in place while a write reservation is active and no further chunk
//! follows, so a tail reservation and a head drain never touch the same
//! chunk.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Idle chunks retained per pool; excess chunks are dropped on recycle.
const MAX_IDLE_CHUNKS: usize = 64;

struct Chunk {
    bytes: Box<[u8]>,
    read: usize,
    write: usize,
}

impl Chunk {
    fn available(&self) -> usize {
        self.write - self.read
    }

    fn full(&self) -> bool {
        self.write == self.bytes.len()
    }
}

struct PoolShared {
    chunk_size: usize,
    free: Mutex<Vec<Chunk>>,
}

/// A thread-safe free list of fixed-size chunks.
///
/// All buffers created from one pool share its free list; chunks circulate
/// between buffers through it. Cloning the pool clones the handle.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool handing out chunks of `chunk_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "buffer pool chunk size must be non-zero");
        Self {
            shared: Arc::new(PoolShared {
                chunk_size,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create an empty buffer backed by this pool.
    #[must_use]
    pub fn buffer(&self) -> Buffer {
        Buffer {
            pool: self.clone(),
            chunks: VecDeque::new(),
            reading: false,
            writing: false,
        }
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    fn take(&self) -> Chunk {
        if let Some(chunk) = self.shared.free.lock().pop() {
            return chunk;
        }
        Chunk {
            bytes: vec![0u8; self.shared.chunk_size].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    fn recycle(&self, mut chunk: Chunk) {
        chunk.read = 0;
        chunk.write = 0;
        let mut free = self.shared.free.lock();
        if free.len() < MAX_IDLE_CHUNKS {
            free.push(chunk);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.shared.free.lock().len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("chunk_size", &self.shared.chunk_size)
            .finish()
    }
}

/// A chained-chunk byte stream with copy and zero-copy access.
///
/// Buffers are single-owner values; move them between threads to hand a
/// byte stream over. Dropping a buffer returns its chunks to the pool.
pub struct Buffer {
    pool: BufferPool,
    chunks: VecDeque<Chunk>,
    reading: bool,
    writing: bool,
}

impl Buffer {
    /// Bytes currently readable: net written minus net read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::available).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.available() == 0)
    }

    /// Return every chunk to the pool and clear both reservation flags.
    pub fn reset(&mut self) {
        while let Some(chunk) = self.chunks.pop_front() {
            self.pool.recycle(chunk);
        }
        self.reading = false;
        self.writing = false;
    }

    /// Append `bytes`, allocating chunks from the pool as needed.
    ///
    /// Fails with [`Error::Writing`] while a write reservation is active.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if self.writing {
            return Err(Error::Writing);
        }
        let mut sum = 0;
        while sum < bytes.len() {
            if self.chunks.back().map_or(true, Chunk::full) {
                self.chunks.push_back(self.pool.take());
            }
            let tail = self
                .chunks
                .back_mut()
                .expect("tail chunk just ensured");
            let take = (tail.bytes.len() - tail.write).min(bytes.len() - sum);
            tail.bytes[tail.write..tail.write + take].copy_from_slice(&bytes[sum..sum + take]);
            tail.write += take;
            sum += take;
        }
        Ok(sum)
    }

    /// Append a single byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte]).map(|_| ())
    }

    /// Copy bytes out of the head chunks into `out`.
    ///
    /// Returns the number of bytes copied; `Ok(0)` signals end of stream.
    /// Fails with [`Error::Reading`] while a read reservation is active.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.reading {
            return Err(Error::Reading);
        }
        let mut sum = 0;
        loop {
            let drained = {
                let Some(head) = self.chunks.front_mut() else {
                    break;
                };
                let avail = head.available();
                if avail == 0 {
                    true
                } else {
                    let take = avail.min(out.len() - sum);
                    out[sum..sum + take].copy_from_slice(&head.bytes[head.read..head.read + take]);
                    head.read += take;
                    sum += take;
                    head.available() == 0
                }
            };
            if drained && !self.unlink_head() {
                break;
            }
            if sum == out.len() {
                break;
            }
        }
        Ok(sum)
    }

    /// Pop one byte off the head, recycling the head chunk when drained.
    ///
    /// Returns `Ok(None)` when the buffer holds no readable bytes.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.reading {
            return Err(Error::Reading);
        }
        let (byte, drained) = {
            let Some(head) = self.chunks.front_mut() else {
                return Ok(None);
            };
            if head.available() == 0 {
                return Ok(None);
            }
            let byte = head.bytes[head.read];
            head.read += 1;
            (byte, head.available() == 0)
        };
        if drained {
            self.unlink_head();
        }
        Ok(Some(byte))
    }

    /// Reserve the readable region of the head chunk for zero-copy draining.
    ///
    /// The slice may be empty. While the reservation is outstanding every
    /// byte-stream read fails with [`Error::Reading`]; commit the
    /// reservation with [`Buffer::end_read`].
    pub fn begin_read(&mut self) -> Result<&[u8]> {
        if self.reading {
            return Err(Error::Reading);
        }
        self.reading = true;
        match self.chunks.front() {
            Some(head) => Ok(&head.bytes[head.read..head.write]),
            None => Ok(&[]),
        }
    }

    /// Commit a read reservation, advancing the head cursor by `read` bytes.
    ///
    /// `read` must not exceed the slice returned by [`Buffer::begin_read`].
    pub fn end_read(&mut self, read: usize) -> Result<()> {
        if !self.reading {
            return Err(Error::Reservation);
        }
        self.reading = false;
        if read == 0 {
            return Ok(());
        }
        let drained = {
            let Some(head) = self.chunks.front_mut() else {
                return Err(Error::Reservation);
            };
            if head.read + read > head.write {
                return Err(Error::Reservation);
            }
            head.read += read;
            head.available() == 0
        };
        if drained {
            self.unlink_head();
        }
        Ok(())
    }

    /// Reserve the spare region of the tail chunk for zero-copy appending,
    /// allocating a fresh tail when the current one is full.
    ///
    /// While the reservation is outstanding every byte-stream write fails
    /// with [`Error::Writing`]; commit it with [`Buffer::end_write`].
    pub fn begin_write(&mut self) -> Result<&mut [u8]> {
        if self.writing {
            return Err(Error::Writing);
        }
        self.writing = true;
        if self.chunks.back().map_or(true, Chunk::full) {
            self.chunks.push_back(self.pool.take());
        }
        let tail = self
            .chunks
            .back_mut()
            .expect("tail chunk just ensured");
        Ok(&mut tail.bytes[tail.write..])
    }

    /// Commit a write reservation, advancing the tail cursor by `wrote`
    /// bytes.
    pub fn end_write(&mut self, wrote: usize) -> Result<()> {
        if !self.writing {
            return Err(Error::Reservation);
        }
        self.writing = false;
        let Some(tail) = self.chunks.back_mut() else {
            return if wrote == 0 { Ok(()) } else { Err(Error::Reservation) };
        };
        if tail.write + wrote > tail.bytes.len() {
            return Err(Error::Reservation);
        }
        tail.write += wrote;
        Ok(())
    }

    /// Recycle a drained head chunk.
    ///
    /// The unlink is suppressed while a write reservation is active and the
    /// head is also the tail; returns whether the head was recycled.
    fn unlink_head(&mut self) -> bool {
        if self.writing && self.chunks.len() == 1 {
            return false;
        }
        match self.chunks.pop_front() {
            Some(chunk) => {
                self.pool.recycle(chunk);
                true
            }
            None => false,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("chunks", &self.chunks.len())
            .field("reading", &self.reading)
            .field("writing", &self.writing)
            .finish()
    }
}
