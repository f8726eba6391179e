//! Event-driven server runtime.
//!
//! The reactor thread owns the readiness facility and the connection map;
//! worker threads run per-connection read/write steps. Shared pieces:
//! - `MemoryAccountant`: process-wide pooled-buffer byte accounting.
//! - `PooledBuffer` / `BufferPool` / `OutboundQueue`: fixed-capacity
//!   buffers, a bounded free list, and the per-connection transmit FIFO.
//! - `Connection`: framing and the read/write state machine.
//! - `WorkerExecutor`: the fixed worker pool.

pub mod buffer;
pub mod connection;
pub mod executor;
pub mod memory;
pub mod reactor;

pub use buffer::{BufferPool, OutboundQueue, PooledBuffer};
pub use connection::{Connection, MessageHandler, DELIMITER};
pub use executor::WorkerExecutor;
pub use memory::MemoryAccountant;
pub use reactor::{Reactor, ReactorHandle};

// Connections are addressed by their mio token in the public API.
pub use mio::Token;
