//! Process-wide accounting of pooled-buffer memory.
//!
//! Every `PooledBuffer` charges its capacity here on construction and
//! credits it back on drop, so `current()` tracks the bytes held by all
//! live pooled buffers. The ceiling is advisory: callers consult
//! `is_exceeded` and refuse new work, the accountant itself never rejects
//! an allocation.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::MAX_TOTAL_MEMORY;

/// Lock-free byte counter with a high-water mark and an advisory ceiling.
pub struct MemoryAccountant {
    current: AtomicUsize,
    peak: AtomicUsize,
    ceiling: usize,
}

static GLOBAL: MemoryAccountant = MemoryAccountant::new(MAX_TOTAL_MEMORY);

impl MemoryAccountant {
    /// Create an accountant with the given ceiling in bytes.
    pub const fn new(ceiling: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            ceiling,
        }
    }

    /// The process-wide accountant charged by every pooled buffer.
    pub fn global() -> &'static MemoryAccountant {
        &GLOBAL
    }

    /// Record an allocation of `bytes`, raising the peak if needed.
    pub fn allocate(&self, bytes: usize) {
        let now = self.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
        // Another thread may raise the peak between our load and store, so
        // retry until our value is stored or the observed peak passes it.
        let mut peak = self.peak.load(Ordering::Acquire);
        while now > peak {
            match self
                .peak
                .compare_exchange_weak(peak, now, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    /// Record a deallocation of `bytes`.
    pub fn deallocate(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Bytes currently held by live pooled buffers.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// High-water mark of `current`.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// The configured ceiling in bytes.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Whether current usage is above the ceiling. Advisory only; consumers
    /// refuse new connections or drop messages, nothing is aborted here.
    pub fn is_exceeded(&self) -> bool {
        self.current() > self.ceiling
    }

    /// Zero both counters.
    pub fn reset(&self) {
        self.current.store(0, Ordering::Release);
        self.peak.store(0, Ordering::Release);
    }
}
