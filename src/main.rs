//! linewire server binary.
//!
//! Accepts newline-framed messages from many concurrent TCP clients and
//! answers each frame with `Server received: <frame>`. Configuration comes
//! from an optional `key=value` file and positional CLI overrides
//! (`port max_connections thread_count`); SIGINT, SIGTERM and SIGUSR1 all
//! trigger an orderly shutdown.

use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use linewire::config::Config;
use linewire::runtime::Reactor;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        max_connections = config.max_connections,
        thread_count = config.thread_count,
        "starting linewire server"
    );

    let mut reactor = Reactor::new(config)?;
    reactor.set_message_handler(|frame, conn| {
        let mut reply = Vec::with_capacity(frame.len() + 17);
        reply.extend_from_slice(b"Server received: ");
        reply.extend_from_slice(frame);
        conn.send_message(&reply);
    });

    // Signal handlers only flip the shutdown flag; the reactor's bounded
    // poll timeout picks it up within a second.
    let shutdown = reactor.handle().shutdown_flag();
    for signal in [SIGINT, SIGTERM, SIGUSR1] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))?;
    }

    if let Err(e) = reactor.start() {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }

    reactor.run()?;
    info!("server exited cleanly");
    Ok(())
}
