//! Per-connection state: read accumulation, newline framing, outbound
//! transmission and lifecycle.
//!
//! A `Connection` is shared as `Arc` between the reactor (which observes
//! readiness) and worker threads (which run the read/write steps). The
//! accumulator mutex doubles as the per-connection step lock, making
//! `handle_read` and `handle_write` mutually exclusive per connection.
//! `close` and `send_message` never take the step lock, so a handler running
//! inside `handle_read` can call them without deadlocking.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, trace, warn};

use crate::config::{MESSAGE_BUFFER_SIZE, READ_ACCUMULATOR_LIMIT, READ_CHUNK_SIZE};
use crate::runtime::buffer::{BufferPool, OutboundQueue, PooledBuffer};
use crate::runtime::memory::MemoryAccountant;

/// Frame delimiter on the wire.
pub const DELIMITER: u8 = b'\n';

/// Per-frame application callback, invoked from worker threads with the
/// frame payload (delimiter removed) and the connection it arrived on.
pub type MessageHandler = dyn Fn(&[u8], &Connection) + Send + Sync;

/// One client socket and everything needed to service it.
pub struct Connection {
    stream: TcpStream,
    fd: RawFd,
    peer: SocketAddr,
    token: Token,
    registry: Arc<Registry>,
    /// Read accumulator; its lock is also the per-connection step mutex.
    accumulator: Mutex<BytesMut>,
    outbound: OutboundQueue,
    /// Pre-allocated formatting area for `send_message`.
    scratch: Mutex<PooledBuffer>,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        token: Token,
        registry: Arc<Registry>,
        pool: Arc<BufferPool>,
    ) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            peer,
            token,
            registry,
            accumulator: Mutex::new(BytesMut::with_capacity(READ_CHUNK_SIZE)),
            outbound: OutboundQueue::new(pool),
            scratch: Mutex::new(PooledBuffer::new(MESSAGE_BUFFER_SIZE)),
            connected: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Drain the socket to exhaustion, extracting and dispatching every
    /// complete frame along the way. Precondition: the readiness facility
    /// reported the socket readable; with edge semantics we must read until
    /// `WouldBlock` or the next event never fires.
    ///
    /// Takes the step lock for the whole drain; must not be called from a
    /// handler.
    pub(crate) fn handle_read(&self, handler: Option<&MessageHandler>) {
        let mut acc = self.accumulator.lock().unwrap();
        if !self.is_connected() {
            return;
        }
        self.touch();

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    trace!(peer = %self.peer, "peer closed");
                    self.close();
                    break;
                }
                Ok(n) => {
                    if acc.len() + n > READ_ACCUMULATOR_LIMIT {
                        warn!(
                            peer = %self.peer,
                            buffered = acc.len(),
                            "read accumulator over limit, disconnecting"
                        );
                        acc.clear();
                        self.close();
                        return;
                    }
                    acc.extend_from_slice(&chunk[..n]);
                    self.dispatch_frames(&mut acc, handler);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "read failed");
                    self.close();
                    break;
                }
            }
        }

        // EOF can leave complete frames behind; deliver them before the
        // reactor reaps this connection.
        self.dispatch_frames(&mut acc, handler);

        if self.is_connected() && !self.outbound.is_empty() {
            self.arm_write();
        }
    }

    fn dispatch_frames(&self, acc: &mut BytesMut, handler: Option<&MessageHandler>) {
        while let Some(frame) = take_frame(acc) {
            if frame.is_empty() {
                continue; // bare delimiter
            }
            match handler {
                Some(handler) => {
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| handler(&frame, self)));
                    if outcome.is_err() {
                        error!(peer = %self.peer, "message handler panicked");
                    }
                }
                None => {
                    trace!(peer = %self.peer, len = frame.len(), "no handler installed, frame dropped")
                }
            }
        }
    }

    /// Flush queued output. Precondition: the readiness facility reported
    /// the socket writable. `WouldBlock` is the normal exit; write interest
    /// stays armed until the queue drains.
    ///
    /// Takes the step lock; must not be called from a handler.
    pub(crate) fn handle_write(&self) {
        let _step = self.accumulator.lock().unwrap();
        if !self.is_connected() {
            return;
        }
        self.touch();

        loop {
            match self.outbound.flush_into(&mut &self.stream) {
                Ok(_) => {
                    self.arm_read_only();
                    // An enqueue can race the disarm; re-arm if one did.
                    if !self.outbound.is_empty() {
                        self.arm_write();
                    }
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "write failed");
                    self.close();
                    break;
                }
            }
        }
    }

    /// Frame `payload` with the trailing delimiter and queue it for
    /// transmission. The message is dropped (logged) when the connection is
    /// closed, the payload does not fit the scratch buffer, the pool is
    /// exhausted, or the memory ceiling is exceeded. Never performs socket
    /// I/O; the reactor arms write interest.
    pub fn send_message(&self, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        if MemoryAccountant::global().is_exceeded() {
            warn!(peer = %self.peer, "memory ceiling exceeded, dropping message");
            return false;
        }
        let mut scratch = self.scratch.lock().unwrap();
        scratch.reset();
        if !scratch.append(payload) || !scratch.append(&[DELIMITER]) {
            warn!(
                peer = %self.peer,
                len = payload.len(),
                "message exceeds buffer class, dropped"
            );
            return false;
        }
        if !self.outbound.enqueue(scratch.data()) {
            warn!(peer = %self.peer, "outbound queue rejected message");
            return false;
        }
        self.touch();
        true
    }

    /// Queue a caller-framed string.
    pub fn send_message_str(&self, payload: &str) -> bool {
        self.send_message(payload.as_bytes())
    }

    /// Queue a caller-prepared buffer as-is; no delimiter is appended.
    pub fn send_buffer(&self, buf: PooledBuffer) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbound.enqueue_buffer(buf);
        self.touch();
        true
    }

    /// Queue raw bytes without framing; used by broadcast and direct sends.
    pub fn send_raw(&self, bytes: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbound.enqueue(bytes)
    }

    /// Close the connection: return queued output to the pool and shut the
    /// socket down. Idempotent, and safe to call from inside a handler. The
    /// fd itself closes when the reactor drops its `Arc`.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.outbound.clear();
            let _ = self.stream.shutdown(Shutdown::Both);
            debug!(peer = %self.peer, "connection closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// The transmit queue, exposed for observability.
    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Refresh the activity clock.
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Time since the last read, write or send on this connection.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Arm write (plus read) interest; edge semantics re-fire on modify, so
    /// an already-writable socket produces an event.
    pub(crate) fn arm_write(&self) {
        self.rearm(Interest::READABLE | Interest::WRITABLE);
    }

    pub(crate) fn arm_read_only(&self) {
        self.rearm(Interest::READABLE);
    }

    fn rearm(&self, interest: Interest) {
        if !self.is_connected() {
            return;
        }
        let mut source = SourceFd(&self.fd);
        if let Err(e) = self.registry.reregister(&mut source, self.token, interest) {
            debug!(peer = %self.peer, error = %e, "reregister failed");
        }
    }
}

/// Split the earliest complete frame off the accumulator, delimiter removed.
fn take_frame(acc: &mut BytesMut) -> Option<BytesMut> {
    let pos = acc.iter().position(|&b| b == DELIMITER)?;
    let mut frame = acc.split_to(pos + 1);
    frame.truncate(pos);
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_MESSAGE_SIZE;
    use std::thread;

    #[test]
    fn test_take_frame_in_order() {
        let mut acc = BytesMut::from(&b"a\nb\nc\n"[..]);
        assert_eq!(&take_frame(&mut acc).unwrap()[..], b"a");
        assert_eq!(&take_frame(&mut acc).unwrap()[..], b"b");
        assert_eq!(&take_frame(&mut acc).unwrap()[..], b"c");
        assert!(take_frame(&mut acc).is_none());
        assert!(acc.is_empty());
    }

    #[test]
    fn test_take_frame_partial() {
        let mut acc = BytesMut::from(&b"hel"[..]);
        assert!(take_frame(&mut acc).is_none());

        acc.extend_from_slice(b"lo\nworld\n");
        assert_eq!(&take_frame(&mut acc).unwrap()[..], b"hello");
        assert_eq!(&take_frame(&mut acc).unwrap()[..], b"world");
        assert!(take_frame(&mut acc).is_none());
    }

    #[test]
    fn test_take_frame_empty_frames() {
        let mut acc = BytesMut::from(&b"\n\nx\n\n"[..]);
        assert_eq!(take_frame(&mut acc).unwrap().len(), 0);
        assert_eq!(take_frame(&mut acc).unwrap().len(), 0);
        assert_eq!(&take_frame(&mut acc).unwrap()[..], b"x");
        assert_eq!(take_frame(&mut acc).unwrap().len(), 0);
        assert!(take_frame(&mut acc).is_none());
    }

    #[test]
    fn test_take_frame_max_size_boundary() {
        let mut payload = vec![b'z'; MAX_MESSAGE_SIZE];
        payload.push(DELIMITER);
        let mut acc = BytesMut::from(&payload[..]);
        let frame = take_frame(&mut acc).unwrap();
        assert_eq!(frame.len(), MAX_MESSAGE_SIZE);
        assert!(acc.is_empty());
    }

    /// Real socket pair plus an unregistered registry; interest re-arming
    /// fails quietly, which is enough for step-level tests.
    fn test_connection() -> (Connection, std::net::TcpStream, mio::Poll) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        let poll = mio::Poll::new().unwrap();
        let registry = Arc::new(poll.registry().try_clone().unwrap());
        let pool = Arc::new(BufferPool::new(MESSAGE_BUFFER_SIZE, 16));
        let conn = Connection::new(
            TcpStream::from_std(server_side),
            peer,
            Token(0),
            registry,
            pool,
        );
        (conn, client, poll)
    }

    #[test]
    fn test_read_dispatches_frames() {
        let (conn, mut client, _poll) = test_connection();
        use std::io::Write as _;
        client.write_all(b"one\ntwo\n").unwrap();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let handler = move |frame: &[u8], _conn: &Connection| {
            sink.lock().unwrap().push(frame.to_vec());
        };

        // Data races the write; retry until it lands.
        for _ in 0..100 {
            conn.handle_read(Some(&handler));
            if frames.lock().unwrap().len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"one");
        assert_eq!(frames[1], b"two");
    }

    #[test]
    fn test_send_message_and_flush() {
        let (conn, mut client, _poll) = test_connection();
        assert!(conn.send_message(b"hello"));
        assert_eq!(conn.outbound().len(), 1);

        conn.handle_write();
        assert!(conn.outbound().is_empty());

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut got = [0u8; 6];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello\n");
    }

    #[test]
    fn test_send_message_too_large_dropped() {
        let (conn, _client, _poll) = test_connection();
        let huge = vec![b'x'; MESSAGE_BUFFER_SIZE]; // no room left for the delimiter
        assert!(!conn.send_message(&huge));
        assert!(conn.outbound().is_empty());

        let fits = vec![b'x'; MESSAGE_BUFFER_SIZE - 1];
        assert!(conn.send_message(&fits));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (conn, _client, _poll) = test_connection();
        conn.send_message(b"never sent");
        assert!(conn.is_connected());

        conn.close();
        assert!(!conn.is_connected());
        assert!(conn.outbound().is_empty());

        conn.close(); // second close is a no-op
        assert!(!conn.is_connected());

        // Everything is a no-op after close.
        assert!(!conn.send_message(b"late"));
        conn.handle_write();
        conn.handle_read(None);
    }

    #[test]
    fn test_eof_disconnects() {
        let (conn, client, _poll) = test_connection();
        drop(client);

        for _ in 0..100 {
            conn.handle_read(None);
            if !conn.is_connected() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let (conn, mut client, _poll) = test_connection();
        use std::io::Write as _;
        client.write_all(b"boom\nok\n").unwrap();

        let survived = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&survived);
        let handler = move |frame: &[u8], _conn: &Connection| {
            if frame == b"boom" {
                panic!("handler exploded");
            }
            sink.lock().unwrap().push(frame.to_vec());
        };

        for _ in 0..100 {
            conn.handle_read(Some(&handler));
            if !survived.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(survived.lock().unwrap()[0], b"ok");
        assert!(conn.is_connected());
    }
}
