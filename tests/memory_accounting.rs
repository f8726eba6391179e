//! Pooled-buffer accounting across a full server lifecycle.
//!
//! Lives in its own binary with a single test: the accountant is
//! process-wide, and these assertions need exclusive use of it.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use linewire::config::{Config, MESSAGE_BUFFER_SIZE};
use linewire::runtime::{MemoryAccountant, Reactor};

#[test]
fn usage_returns_to_baseline_after_shutdown() {
    let accountant = MemoryAccountant::global();
    let baseline = accountant.current();

    {
        let mut reactor = Reactor::new(Config {
            port: 0,
            max_connections: 16,
            thread_count: 2,
            log_level: "warn".to_string(),
        })
        .unwrap();
        reactor.set_message_handler(|frame, conn| {
            let mut reply = Vec::with_capacity(frame.len() + 17);
            reply.extend_from_slice(b"Server received: ");
            reply.extend_from_slice(frame);
            conn.send_message(&reply);
        });
        reactor.start().unwrap();
        let addr = reactor.local_addr().unwrap();
        let handle = reactor.handle();

        // The outbound pool pre-populates, so usage rises immediately.
        assert!(accountant.current() > baseline);

        let join = thread::spawn(move || reactor.run().unwrap());

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        client.write_all(b"hello\n").unwrap();

        let mut response = [0u8; 23];
        client.read_exact(&mut response).unwrap();
        assert_eq!(&response[..], b"Server received: hello\n");

        // A live connection holds at least its scratch buffer.
        assert!(accountant.peak() >= baseline + MESSAGE_BUFFER_SIZE);

        drop(client);
        handle.stop();
        join.join().unwrap();
    }

    // Reactor, pool, connections and scratch buffers are gone; every
    // charged byte must have been credited back.
    assert_eq!(accountant.current(), baseline);
}
