//! Pooled message buffers.
//!
//! `PooledBuffer` is a fixed-capacity byte region with a fill length and a
//! send cursor, so a partially written buffer resumes where the socket
//! stopped without copying. `BufferPool` keeps a bounded free list of one
//! capacity class, and `OutboundQueue` is the per-connection FIFO of buffers
//! awaiting transmission. Every buffer's capacity is charged to the
//! process-wide `MemoryAccountant` for its whole lifetime.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::config::POOL_PREALLOC;
use crate::runtime::memory::MemoryAccountant;

/// Fixed-capacity byte region with an append cursor and a send cursor.
///
/// `len` is the filled length, `offset` is how much of it has been handed to
/// the socket. `0 <= offset <= len <= capacity` holds at every method
/// boundary.
pub struct PooledBuffer {
    data: Box<[u8]>,
    len: usize,
    offset: usize,
}

impl PooledBuffer {
    /// Allocate a buffer of `capacity` bytes, charged to the accountant.
    pub fn new(capacity: usize) -> Self {
        MemoryAccountant::global().allocate(capacity);
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            offset: 0,
        }
    }

    /// Append `bytes`. Fails, leaving the buffer untouched, when the filled
    /// length would exceed capacity.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if self.len + bytes.len() > self.data.len() {
            return false;
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Write the range `[start, len)` to `writer`, advancing the send cursor
    /// by however many bytes were accepted.
    ///
    /// `WouldBlock` propagates untouched; it is the caller's benign stop
    /// condition. A writer that accepts zero bytes over a non-empty range is
    /// reported as `WriteZero`.
    pub fn send_partial<W: Write>(&mut self, writer: &mut W, start: usize) -> io::Result<usize> {
        if start >= self.len {
            return Ok(0);
        }
        let sent = writer.write(&self.data[start..self.len])?;
        if sent == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        self.offset = start + sent;
        Ok(sent)
    }

    /// Whether every filled byte has been sent.
    pub fn is_complete(&self) -> bool {
        self.offset >= self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled region.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unfilled capacity.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// The send cursor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Clear for reuse without reallocating.
    pub fn reset(&mut self) {
        self.len = 0;
        self.offset = 0;
    }

    /// Move the tail `[pos, len)` into a new buffer of the same capacity,
    /// truncating this one to `pos`. `None` when `pos` is past the end.
    pub fn split_at(&mut self, pos: usize) -> Option<PooledBuffer> {
        if pos >= self.len {
            return None;
        }
        let mut tail = PooledBuffer::new(self.capacity());
        // Same capacity, strictly shorter contents: cannot fail.
        tail.append(&self.data[pos..self.len]);
        self.len = pos;
        Some(tail)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        MemoryAccountant::global().deallocate(self.data.len());
    }
}

struct PoolState {
    free: Vec<PooledBuffer>,
    acquired: usize,
}

/// Bounded free list of `PooledBuffer`s of one capacity class.
///
/// `acquire` hands out at most `max_buffers` concurrently; `release` returns
/// a buffer to the free list or destroys it when the list is already full.
/// Free-list mutations are serialized internally, so the pool can be shared
/// across worker threads behind an `Arc`.
pub struct BufferPool {
    buffer_size: usize,
    max_buffers: usize,
    state: Mutex<PoolState>,
    // Mirrors of the locked counters for lock-free observability.
    free_count: AtomicUsize,
    acquired_count: AtomicUsize,
}

impl BufferPool {
    /// Create a pool of `buffer_size`-byte buffers, pre-populating a few to
    /// amortize first use.
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        let prealloc = POOL_PREALLOC.min(max_buffers);
        let mut free = Vec::with_capacity(prealloc);
        for _ in 0..prealloc {
            free.push(PooledBuffer::new(buffer_size));
        }
        Self {
            buffer_size,
            max_buffers,
            free_count: AtomicUsize::new(prealloc),
            acquired_count: AtomicUsize::new(0),
            state: Mutex::new(PoolState { free, acquired: 0 }),
        }
    }

    /// Take a buffer from the free list, or allocate a fresh one while fewer
    /// than `max_buffers` are out. `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        let mut state = self.state.lock().unwrap();
        if let Some(mut buf) = state.free.pop() {
            state.acquired += 1;
            self.publish_counts(&state);
            buf.reset();
            return Some(buf);
        }
        if state.acquired < self.max_buffers {
            state.acquired += 1;
            self.publish_counts(&state);
            return Some(PooledBuffer::new(self.buffer_size));
        }
        trace!(max = self.max_buffers, "buffer pool exhausted");
        None
    }

    /// Return a buffer. It is destroyed instead of pooled when the free list
    /// is already full.
    pub fn release(&self, mut buf: PooledBuffer) {
        buf.reset();
        let mut state = self.state.lock().unwrap();
        state.acquired = state.acquired.saturating_sub(1);
        if state.free.len() < self.max_buffers {
            state.free.push(buf);
        }
        self.publish_counts(&state);
    }

    fn publish_counts(&self, state: &PoolState) {
        self.free_count.store(state.free.len(), Ordering::Release);
        self.acquired_count.store(state.acquired, Ordering::Release);
    }

    /// Capacity of each buffer in this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Most buffers this pool will hand out at once.
    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    /// Buffers currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    /// Buffers currently loaned out.
    pub fn acquired_count(&self) -> usize {
        self.acquired_count.load(Ordering::Acquire)
    }
}

/// FIFO of pooled buffers awaiting transmission on one connection.
///
/// The head buffer is the one in flight; its send cursor advances in place
/// across partial writes and it returns to the pool once fully sent. All
/// operations lock internally and are callable from any thread.
pub struct OutboundQueue {
    queue: Mutex<VecDeque<PooledBuffer>>,
    pool: Arc<BufferPool>,
}

impl OutboundQueue {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            pool,
        }
    }

    /// Copy `bytes` into a pool buffer and append it to the queue. Fails
    /// when the pool is exhausted or the payload exceeds the buffer class;
    /// an acquired buffer goes straight back to the pool on failure.
    pub fn enqueue(&self, bytes: &[u8]) -> bool {
        let Some(mut buf) = self.pool.acquire() else {
            return false;
        };
        if !buf.append(bytes) {
            self.pool.release(buf);
            return false;
        }
        self.queue.lock().unwrap().push_back(buf);
        true
    }

    /// Append a caller-prepared buffer without copying.
    pub fn enqueue_buffer(&self, buf: PooledBuffer) {
        self.queue.lock().unwrap().push_back(buf);
    }

    /// Drive the head-of-queue send loop: write each head buffer from its
    /// cursor, release completed buffers to the pool, stop when the queue
    /// empties. Errors (including `WouldBlock`) propagate with the head
    /// buffer left in place, so the next call resumes at its cursor.
    pub fn flush_into<W: Write>(&self, writer: &mut W) -> io::Result<usize> {
        let mut queue = self.queue.lock().unwrap();
        let mut total = 0;
        while let Some(head) = queue.front_mut() {
            let start = head.offset();
            total += head.send_partial(writer, start)?;
            if head.is_complete() {
                if let Some(done) = queue.pop_front() {
                    self.pool.release(done);
                }
            }
        }
        Ok(total)
    }

    /// Return the head buffer to the pool and remove it without sending.
    pub fn pop(&self) {
        if let Some(buf) = self.queue.lock().unwrap().pop_front() {
            self.pool.release(buf);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Return every queued buffer to the pool.
    pub fn clear(&self) {
        let mut queue = self.queue.lock().unwrap();
        for buf in queue.drain(..) {
            self.pool.release(buf);
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}
