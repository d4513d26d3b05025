//! Serving individual QUIC streams.
//!
//! Each peer-opened stream runs in its own task, which serializes all of
//! that stream's events. The task reads the request header, then feeds the
//! response engine's chunks to quinn one at a time; a chunk completes when
//! quinn accepts it into the stream's send buffer.

use crate::error::StreamError;
use crate::runtime::buffer::{SendBuffer, SendBufferPool};
use crate::runtime::engine::{self, ChunkSink, Progress};
use crate::runtime::pool::Pooled;
use crate::runtime::quic::QuicShared;
use crate::runtime::stream::{PerfStream, StreamKind};
use quinn::{RecvStream, SendStream, VarInt};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Application error code for protocol violations.
pub const APP_ERROR_PROTOCOL: u32 = 1;
/// Application error code when server resources are exhausted.
pub const APP_ERROR_EXHAUSTED: u32 = 2;

/// Chunks produced by one [`engine::drive`] pass, written in order.
#[derive(Default)]
struct QueuedSink {
    chunks: VecDeque<SendBuffer>,
    finish: bool,
}

impl ChunkSink for QueuedSink {
    fn submit(&mut self, chunk: SendBuffer) {
        self.chunks.push_back(chunk);
    }

    fn shutdown_send(&mut self) {
        self.finish = true;
    }
}

/// Serve a request/response stream.
pub async fn serve_bidirectional(shared: &QuicShared, mut send: SendStream, mut recv: RecvStream) {
    let id = send.id();
    let result = async {
        let mut stream = open(shared, StreamKind::Bidirectional)?;
        receive_request(shared, &mut stream, &mut recv).await?;
        send_response(shared, &mut stream, &mut send).await?;
        Ok::<_, StreamError>(stream)
    }
    .await;

    match result {
        Ok(stream) => trace!(
            stream_id = %id,
            bytes_sent = stream.bytes_sent(),
            bytes_received = stream.bytes_received(),
            "Stream complete"
        ),
        Err(e) => {
            log_failure(id, &e);
            if let Some(code) = error_code(&e) {
                let _ = send.reset(code);
                let _ = recv.stop(code);
            }
        }
    }
}

/// Serve a peer-initiated unidirectional stream as an upload sink.
pub async fn serve_receive_only(shared: &QuicShared, mut recv: RecvStream) {
    let id = recv.id();
    let result = async {
        let mut stream = open(shared, StreamKind::ReceiveOnly)?;
        receive_request(shared, &mut stream, &mut recv).await?;
        debug_assert!(stream.is_closed());
        Ok::<_, StreamError>(stream)
    }
    .await;

    match result {
        Ok(stream) => trace!(
            stream_id = %id,
            bytes_received = stream.bytes_received(),
            "Upload complete"
        ),
        Err(e) => {
            log_failure(id, &e);
            if let Some(code) = error_code(&e) {
                let _ = recv.stop(code);
            }
        }
    }
}

fn open(shared: &QuicShared, kind: StreamKind) -> Result<Pooled<PerfStream>, StreamError> {
    let mut stream = shared
        .ctx
        .streams
        .acquire()
        .ok_or(StreamError::ResourceExhausted("stream"))?;
    stream.open(&shared.ctx.settings, kind);
    Ok(stream)
}

/// Read until the request header is parsed and the receive side is shut.
///
/// Unidirectional requests shut the receive side as soon as the header
/// parses; nothing after it is read.
async fn receive_request(
    shared: &QuicShared,
    stream: &mut PerfStream,
    recv: &mut RecvStream,
) -> Result<(), StreamError> {
    let max_len = shared.ctx.settings.io_size as usize;
    while !stream.is_recv_shutdown() {
        match recv.read_chunk(max_len, true).await? {
            Some(chunk) => stream.on_receive(&chunk.bytes)?,
            None => stream.on_recv_shutdown()?,
        }
    }
    if stream.unidirectional() {
        let _ = recv.stop(VarInt::from_u32(0));
    }
    Ok(())
}

/// Generate the response under the stream's send window.
async fn send_response(
    shared: &QuicShared,
    stream: &mut PerfStream,
    send: &mut SendStream,
) -> Result<(), StreamError> {
    let pool = &shared.send_buffers;
    let mut sink = QueuedSink::default();

    loop {
        let progress = engine::drive(stream, pool, &mut sink);

        if let Some(chunk) = sink.chunks.pop_front() {
            let len = chunk.len();
            let written = send.write_chunk(chunk.bytes().clone()).await;
            stream.on_send_complete(len);
            drop(chunk);
            written?;
            continue;
        }

        if sink.finish {
            send.finish()?;
            return Ok(());
        }

        match progress {
            Progress::Starved => wait_for_descriptor(pool, send).await?,
            // Every chunk has completed, so the engine either submits,
            // starves, or shuts down; anything else means the stream ended.
            Progress::Waiting | Progress::Closed => return Ok(()),
        }
    }
}

/// Wait until a descriptor is released or the peer stops the stream.
async fn wait_for_descriptor(
    pool: &SendBufferPool,
    send: &mut SendStream,
) -> Result<(), StreamError> {
    let released = pool.released();
    tokio::pin!(released);
    released.as_mut().enable();
    if pool.available() > 0 {
        return Ok(());
    }

    let id = send.id();
    tokio::select! {
        _ = &mut released => Ok(()),
        stopped = send.stopped() => {
            debug!(stream_id = %id, stopped = ?stopped, "Peer stopped stream while starved");
            Err(StreamError::PeerStopped)
        }
    }
}

/// Application error code sent to the peer, if the failure warrants one.
fn error_code(error: &StreamError) -> Option<VarInt> {
    match error {
        StreamError::Protocol(_) => Some(VarInt::from_u32(APP_ERROR_PROTOCOL)),
        StreamError::ResourceExhausted(_) => Some(VarInt::from_u32(APP_ERROR_EXHAUSTED)),
        _ => None,
    }
}

fn log_failure(id: quinn::StreamId, error: &StreamError) {
    match error {
        StreamError::Protocol(_) => debug!(stream_id = %id, error = %error, "Stream protocol error"),
        e if e.is_abort() => trace!(stream_id = %id, error = %e, "Stream aborted"),
        e => debug!(stream_id = %id, error = %e, "Stream failed"),
    }
}
