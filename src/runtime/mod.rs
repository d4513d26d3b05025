//! Runtime for serving perf streams.
//!
//! Two backends share the same stream machinery:
//! - `tcp`: mio event loops, one per worker thread, multiplexing streams
//!   over each TCP connection
//! - `quic`: quinn on a tokio runtime, one task per connection and per stream
//!
//! Both share common abstractions:
//! - `PerfStream`: per-stream state machine
//! - `engine::drive`: flow-controlled response generation over a `ChunkSink`
//! - `ObjectPool`/`SendBufferPool`: bounded stream state and send descriptors

pub mod buffer;
pub mod engine;
pub mod pool;
pub mod quic;
pub mod shutdown;
pub mod stream;
pub mod tcp;
mod token;

use crate::config::Config;
use buffer::SendBufferPool;
use bytes::Bytes;
use pool::ObjectPool;
use shutdown::StopSignal;
use std::sync::Arc;
use std::time::Duration;
use stream::{PerfStream, StreamSettings};

/// Resources shared by every backend.
#[derive(Clone)]
pub struct ServerContext {
    pub settings: StreamSettings,
    /// Stream state, shared by all connections of both backends.
    pub streams: Arc<ObjectPool<PerfStream>>,
    /// Response filler, allocated once and sliced by every send pool.
    filler: Bytes,
    send_buffer_count: usize,
    pub max_connections: usize,
    pub drain_timeout: Duration,
    pub stop: StopSignal,
}

impl ServerContext {
    pub fn new(config: &Config, stop: StopSignal) -> Self {
        Self {
            settings: config.stream,
            streams: ObjectPool::new(config.stream_pool),
            filler: Bytes::from(vec![0u8; config.stream.io_size as usize]),
            send_buffer_count: config.send_buffer_pool,
            max_connections: config.max_connections,
            drain_timeout: config.drain_timeout,
            stop,
        }
    }

    /// A new send descriptor pool over the shared filler.
    ///
    /// Each TCP worker owns one; the QUIC backend shares one.
    pub fn send_buffers(&self) -> Arc<SendBufferPool> {
        SendBufferPool::with_filler(self.send_buffer_count, self.filler.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Context with small pools for loopback tests.
    pub fn context(settings: StreamSettings) -> ServerContext {
        context_with(settings, 64, 32)
    }

    pub fn context_with(
        settings: StreamSettings,
        stream_pool: usize,
        send_buffers: usize,
    ) -> ServerContext {
        ServerContext {
            settings,
            streams: ObjectPool::new(stream_pool),
            filler: Bytes::from(vec![0u8; settings.io_size as usize]),
            send_buffer_count: send_buffers,
            max_connections: 16,
            drain_timeout: Duration::from_millis(500),
            stop: StopSignal::new(),
        }
    }
}
