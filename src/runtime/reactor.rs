//! Event-dispatch core.
//!
//! The reactor owns the listening socket and the readiness facility (epoll
//! via mio, edge-style semantics). It accepts sockets, hands read/write
//! readiness to the worker pool, and tears everything down on shutdown.
//! All connection-map writes happen on the reactor thread; cloneable
//! [`ReactorHandle`]s give other threads stop/broadcast/metrics access.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info, trace, warn};

use crate::config::{
    Config, CLEANUP_INTERVAL_SECS, EVENT_BATCH_SIZE, INACTIVITY_TIMEOUT_SECS,
    MESSAGE_BUFFER_SIZE, OUTBOUND_POOL_MAX, POLL_TIMEOUT,
};
use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{Connection, MessageHandler};
use crate::runtime::executor::WorkerExecutor;
use crate::runtime::memory::MemoryAccountant;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// State reachable from `ReactorHandle`s on any thread.
struct Shared {
    /// Live connections, keyed by token. Written only on the reactor
    /// thread; read from handle methods anywhere.
    connections: RwLock<Slab<Arc<Connection>>>,
    registry: Arc<Registry>,
    waker: Waker,
    running: AtomicBool,
    shutdown: Arc<AtomicBool>,
    peak_connections: AtomicUsize,
}

/// Single-threaded owner of the listener and the poll loop.
pub struct Reactor {
    config: Config,
    poll: Poll,
    listener: Option<TcpListener>,
    pool: Arc<BufferPool>,
    executor: WorkerExecutor,
    handler: Option<Arc<MessageHandler>>,
    shared: Arc<Shared>,
}

impl Reactor {
    pub fn new(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let executor = WorkerExecutor::new(config.thread_count)?;
        let pool = Arc::new(BufferPool::new(MESSAGE_BUFFER_SIZE, OUTBOUND_POOL_MAX));

        let shared = Arc::new(Shared {
            connections: RwLock::new(Slab::with_capacity(config.max_connections.min(1024))),
            registry,
            waker,
            running: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            peak_connections: AtomicUsize::new(0),
        });

        Ok(Self {
            config,
            poll,
            listener: None,
            pool,
            executor,
            handler: None,
            shared,
        })
    }

    /// Install the per-frame callback invoked by every connection. The
    /// handler runs on worker threads and must be thread-safe.
    pub fn set_message_handler<F>(&mut self, handler: F)
    where
        F: Fn(&[u8], &Connection) + Send + Sync + 'static,
    {
        let handler: Arc<MessageHandler> = Arc::new(handler);
        self.handler = Some(handler);
    }

    /// Bind the listening socket and register it for read readiness.
    /// Startup failures (bind, listen, registration) surface here and are
    /// fatal to the caller.
    pub fn start(&mut self) -> io::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = create_listener(addr, self.config.max_connections)?;
        let mut listener = TcpListener::from_std(listener);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(
            port = listener.local_addr()?.port(),
            max_connections = self.config.max_connections,
            workers = self.config.thread_count,
            "server listening"
        );
        self.listener = Some(listener);
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    /// The bound address; available after `start` (port 0 binds ephemeral).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// A cloneable handle for control and messaging from other threads.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The event loop. Blocks until `stop()` is called on a handle or a
    /// registered signal flips the shutdown flag; the bounded poll timeout
    /// guarantees either is observed within about a second.
    pub fn run(&mut self) -> io::Result<()> {
        if self.listener.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "start() must be called before run()",
            ));
        }

        let mut events = Events::with_capacity(EVENT_BATCH_SIZE);
        let mut last_sweep = Instant::now();

        while self.shared.running.load(Ordering::Acquire)
            && !self.shared.shutdown.load(Ordering::Acquire)
        {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {} // shutdown flags re-checked above
                    token => self.dispatch(token, event),
                }
            }

            if last_sweep.elapsed() >= Duration::from_secs(CLEANUP_INTERVAL_SECS) {
                self.sweep(INACTIVITY_TIMEOUT_SECS);
                last_sweep = Instant::now();
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Accept until the listener reports `WouldBlock` (edge semantics).
    fn accept_connections(&self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if MemoryAccountant::global().is_exceeded() {
                        warn!(peer = %peer, "memory ceiling exceeded, refusing connection");
                        continue;
                    }

                    let mut connections = self.shared.connections.write().unwrap();
                    if connections.len() >= self.config.max_connections {
                        warn!(peer = %peer, "connection limit reached, refusing");
                        continue;
                    }

                    let entry = connections.vacant_entry();
                    let token = Token(entry.key());
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!(peer = %peer, error = %e, "failed to register connection");
                        continue;
                    }

                    let conn = Arc::new(Connection::new(
                        stream,
                        peer,
                        token,
                        Arc::clone(&self.shared.registry),
                        Arc::clone(&self.pool),
                    ));
                    entry.insert(conn);

                    let live = connections.len();
                    self.shared
                        .peak_connections
                        .fetch_max(live, Ordering::AcqRel);
                    debug!(peer = %peer, token = token.0, live, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Route one readiness event: hangup/error to cleanup, read and write
    /// readiness to the worker pool.
    fn dispatch(&self, token: Token, event: &mio::event::Event) {
        let conn = {
            let connections = self.shared.connections.read().unwrap();
            match connections.get(token.0) {
                Some(conn) => Arc::clone(conn),
                None => return, // already cleaned up
            }
        };

        if event.is_error() || event.is_read_closed() {
            trace!(token = token.0, "peer hung up");
            self.cleanup(token);
            return;
        }

        if event.is_readable() {
            let conn = Arc::clone(&conn);
            let handler = self.handler.clone();
            self.executor
                .submit(move || conn.handle_read(handler.as_deref()));
        }
        if event.is_writable() {
            self.executor.submit(move || conn.handle_write());
        }
    }

    /// Remove a connection from the map, deregister it and close it. A
    /// worker mid-step keeps its own `Arc`; the socket closes for good when
    /// the last clone drops.
    fn cleanup(&self, token: Token) {
        let conn = self.shared.connections.write().unwrap().try_remove(token.0);
        if let Some(conn) = conn {
            deregister(&self.shared.registry, &conn);
            conn.close();
            trace!(token = token.0, "connection cleaned up");
        }
    }

    /// Reap disconnected stragglers and idle connections.
    fn sweep(&self, idle_cutoff_secs: u64) {
        let cutoff = Duration::from_secs(idle_cutoff_secs);
        let stale: Vec<Token> = {
            let connections = self.shared.connections.read().unwrap();
            connections
                .iter()
                .filter(|(_, c)| !c.is_connected() || c.idle_for() > cutoff)
                .map(|(key, _)| Token(key))
                .collect()
        };
        for token in stale {
            self.cleanup(token);
        }
    }

    /// Close every connection, release the listener and join the workers.
    fn shutdown(&mut self) {
        info!("shutting down");
        self.shared.running.store(false, Ordering::Release);

        let drained: Vec<Arc<Connection>> =
            self.shared.connections.write().unwrap().drain().collect();
        for conn in &drained {
            deregister(&self.shared.registry, conn);
            conn.close();
        }

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.executor.stop();
        info!("shutdown complete");
    }
}

/// Cloneable control surface over a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Request shutdown and wake the event loop. Idempotent; callable from
    /// any thread.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            debug!(error = %e, "waker failed");
        }
    }

    /// The flag observed by the reactor loop. Hand it to `signal_hook`'s
    /// `flag::register` so signals trigger the same orderly shutdown; the
    /// handler itself only flips the flag.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.shutdown)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue `bytes` on every live connection and arm write interest. The
    /// payload is sent as-is; the caller includes any framing delimiter.
    /// Returns how many connections accepted the payload.
    pub fn broadcast(&self, bytes: &[u8]) -> usize {
        let connections = self.shared.connections.read().unwrap();
        let mut delivered = 0;
        for (_, conn) in connections.iter() {
            if conn.send_raw(bytes) {
                conn.arm_write();
                delivered += 1;
            }
        }
        delivered
    }

    /// Queue `bytes` on one connection, identified by its token.
    pub fn send_to_client(&self, token: Token, bytes: &[u8]) -> bool {
        let connections = self.shared.connections.read().unwrap();
        match connections.get(token.0) {
            Some(conn) if conn.send_raw(bytes) => {
                conn.arm_write();
                true
            }
            _ => false,
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.read().unwrap().len()
    }

    /// High-water mark of concurrent connections.
    pub fn peak_connection_count(&self) -> usize {
        self.shared.peak_connections.load(Ordering::Acquire)
    }

    /// Close every connection idle longer than `timeout_secs`. Closed
    /// entries are reaped from the map by the reactor's periodic sweep.
    /// Returns how many were closed.
    pub fn cleanup_inactive(&self, timeout_secs: u64) -> usize {
        let cutoff = Duration::from_secs(timeout_secs);
        let connections = self.shared.connections.read().unwrap();
        let mut closed = 0;
        for (_, conn) in connections.iter() {
            if conn.is_connected() && conn.idle_for() > cutoff {
                debug!(peer = %conn.peer_addr(), "closing inactive connection");
                conn.close();
                closed += 1;
            }
        }
        closed
    }
}

fn deregister(registry: &Registry, conn: &Connection) {
    let fd = conn.raw_fd();
    let _ = registry.deregister(&mut SourceFd(&fd));
}

/// Build the non-blocking listening socket with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: usize) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as usize) as i32)?;

    Ok(socket.into())
}
