//! stream-perf: a throughput/latency benchmarking server
//!
//! Clients open streams, send a small request header naming how many bytes
//! they want back, and the server generates that many bytes as fast as the
//! transport allows. Two transports are served:
//! - QUIC (quinn), one perf request per stream
//! - TCP with a length-prefixed framing layer multiplexing many streams
//!   over one connection
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod error;
mod protocols;
mod runtime;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        workers = config.workers,
        io_size = config.stream.io_size,
        send_buffer = config.stream.ideal_send_buffer,
        buffered_io = config.stream.buffered_io,
        "Starting stream-perf server"
    );

    let result = Server::new(config).and_then(Server::run);
    if let Err(e) = result {
        error!(error = %e, "Server failed");
        std::process::exit(1);
    }
    Ok(())
}
