//! Flow-controlled response engine.
//!
//! Turns a stream's send window into chunks for whichever transport carries
//! the stream. Backends implement [`ChunkSink`]; the engine never blocks and
//! never waits for completions itself. Callers report completions on the
//! stream and call [`drive`] again.

use crate::runtime::buffer::{SendBuffer, SendBufferPool};
use crate::runtime::stream::PerfStream;
use std::sync::Arc;

/// Transport-specific delivery of one stream's outbound data.
pub trait ChunkSink {
    /// Queue a chunk. Its descriptor must be dropped once the transport
    /// reports the chunk complete.
    fn submit(&mut self, chunk: SendBuffer);

    /// Close the send direction after all submitted chunks.
    fn shutdown_send(&mut self);
}

/// Outcome of one [`drive`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The window is full or the request is not ready; wait for the next
    /// receive or completion.
    Waiting,
    /// The send buffer pool is exhausted; retry once a descriptor is released.
    Starved,
    /// The stream is closed and may be retired.
    Closed,
}

/// Submit as many chunks as the stream's window allows, then shut the send
/// side once every response byte has completed.
pub fn drive<S: ChunkSink>(
    stream: &mut PerfStream,
    pool: &Arc<SendBufferPool>,
    sink: &mut S,
) -> Progress {
    while let Some(len) = stream.next_chunk_len() {
        let Some(chunk) = pool.acquire(len) else {
            return Progress::Starved;
        };
        debug_assert!(!chunk.is_empty(), "send buffer size must be non-zero");
        stream.on_submit(chunk.len());
        sink.submit(chunk);
    }

    if stream.should_shutdown_send() {
        stream.shutdown_send();
        sink.shutdown_send();
    }

    if stream.is_closed() {
        Progress::Closed
    } else {
        Progress::Waiting
    }
}
