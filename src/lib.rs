//! linewire: an event-driven TCP server for newline-delimited messages.
//!
//! The server multiplexes many client sockets over one readiness facility
//! (epoll via mio), frames inbound bytes on `\n`, hands each frame to an
//! application-supplied handler, and transmits handler output through
//! per-connection queues of pooled buffers so partial writes resume without
//! copying or reallocating.
//!
//! Building blocks:
//! - [`runtime::MemoryAccountant`]: process-wide byte accounting for pooled
//!   buffers with an advisory ceiling.
//! - [`runtime::PooledBuffer`] / [`runtime::BufferPool`] /
//!   [`runtime::OutboundQueue`]: fixed-capacity buffers, a bounded free list,
//!   and the per-connection transmit FIFO.
//! - [`runtime::Connection`]: per-socket framing and read/write state machine.
//! - [`runtime::Reactor`]: the single-threaded event loop that accepts
//!   sockets and dispatches readiness to a [`runtime::WorkerExecutor`].

pub mod config;
pub mod runtime;
