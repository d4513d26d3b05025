//! Multiplexed stream session for one TCP connection.
//!
//! [`MuxSession`] owns everything about a connection except the socket:
//! the frame decoder, the stream table, and the outbound frame queue. The
//! event loop feeds it bytes and hands it a writer when the socket is
//! writable, which keeps the session testable against in-memory I/O.

use crate::error::{ConnectionError, ProtocolError};
use crate::protocols::mux::{
    encode_header, Frame, FrameDecoder, FrameFlags, Slot, StreamTable, FRAME_HEADER_LEN,
};
use crate::runtime::buffer::{SendBuffer, SendBufferPool};
use crate::runtime::engine::{self, ChunkSink, Progress};
use crate::runtime::pool::{ObjectPool, Pooled};
use crate::runtime::stream::{PerfStream, StreamKind, StreamSettings};
use mio::net::TcpStream;
use mio::Interest;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Frames gathered into one vectored write.
const MAX_WRITE_FRAMES: usize = 64;

/// Queued payload-free frames at which the session stops reading.
const CONTROL_HIGH_WATER: usize = 1024;

/// Queued payload-free frames below which reading resumes.
const CONTROL_LOW_WATER: usize = CONTROL_HIGH_WATER / 2;

/// One queued outbound frame.
struct OutFrame {
    stream_id: u32,
    header: [u8; FRAME_HEADER_LEN],
    payload: Option<SendBuffer>,
    /// Bytes of header and payload already written.
    written: usize,
}

impl OutFrame {
    fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, SendBuffer::len)
    }

    fn len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload_len()
    }

    /// Push the unwritten parts of this frame onto `slices`.
    fn unwritten<'a>(&'a self, slices: &mut Vec<IoSlice<'a>>) {
        if self.written < FRAME_HEADER_LEN {
            slices.push(IoSlice::new(&self.header[self.written..]));
        }
        if let Some(payload) = &self.payload {
            let offset = self.written.saturating_sub(FRAME_HEADER_LEN);
            if offset < payload.len() {
                slices.push(IoSlice::new(&payload.bytes()[offset..]));
            }
        }
    }
}

/// Outbound frames of all streams, serialized onto one socket.
#[derive(Default)]
pub struct OutboundQueue {
    frames: VecDeque<OutFrame>,
    /// Queued frames without payload (fin and abort).
    control: usize,
}

impl OutboundQueue {
    /// Queue a data frame carrying `chunk`.
    pub fn push_data(&mut self, stream_id: u32, chunk: SendBuffer) {
        let header = encode_header(stream_id, FrameFlags::default(), chunk.len() as u32);
        self.frames.push_back(OutFrame {
            stream_id,
            header,
            payload: Some(chunk),
            written: 0,
        });
    }

    /// Queue a payload-free frame.
    pub fn push_control(&mut self, stream_id: u32, flags: FrameFlags) {
        self.control += 1;
        self.frames.push_back(OutFrame {
            stream_id,
            header: encode_header(stream_id, flags, 0),
            payload: None,
            written: 0,
        });
    }

    /// Drop every unstarted frame of `stream_id`.
    ///
    /// A partially written frame stays queued so framing stays intact.
    pub fn purge(&mut self, stream_id: u32) {
        self.frames
            .retain(|frame| frame.stream_id != stream_id || frame.written > 0);
        self.control = self
            .frames
            .iter()
            .filter(|frame| frame.payload.is_none())
            .count();
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of queued payload-free frames.
    pub fn control_len(&self) -> usize {
        self.control
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Write queued frames until the queue empties or the writer would block.
    ///
    /// Every data frame written in full is reported in `completed` as
    /// `(stream_id, payload_len)`; its descriptor is released.
    pub fn flush<W: Write>(
        &mut self,
        writer: &mut W,
        completed: &mut Vec<(u32, usize)>,
    ) -> io::Result<()> {
        while !self.frames.is_empty() {
            let n = {
                let mut slices = Vec::with_capacity(MAX_WRITE_FRAMES * 2);
                for frame in self.frames.iter().take(MAX_WRITE_FRAMES) {
                    frame.unwritten(&mut slices);
                }
                match writer.write_vectored(&slices) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            self.advance(n, completed);
        }
        Ok(())
    }

    fn advance(&mut self, mut n: usize, completed: &mut Vec<(u32, usize)>) {
        while n > 0 {
            let Some(frame) = self.frames.front_mut() else {
                break;
            };
            let remaining = frame.len() - frame.written;
            if n < remaining {
                frame.written += n;
                break;
            }
            n -= remaining;
            if let Some(frame) = self.frames.pop_front() {
                if frame.payload.is_some() {
                    completed.push((frame.stream_id, frame.payload_len()));
                } else {
                    self.control -= 1;
                }
            }
        }
    }
}

/// [`ChunkSink`] that frames one stream's chunks onto the connection.
struct FrameSink<'a> {
    stream_id: u32,
    queue: &'a mut OutboundQueue,
}

impl ChunkSink for FrameSink<'_> {
    fn submit(&mut self, chunk: SendBuffer) {
        self.queue.push_data(self.stream_id, chunk);
    }

    fn shutdown_send(&mut self) {
        self.queue.push_control(self.stream_id, FrameFlags::fin());
    }
}

/// Stream multiplexing state for one connection.
pub struct MuxSession {
    decoder: FrameDecoder,
    table: StreamTable<Pooled<PerfStream>>,
    outbound: OutboundQueue,
    /// Streams waiting for a send descriptor.
    starved: Vec<u32>,
    draining: bool,
    /// The peer closed its write side.
    read_closed: bool,
    /// Too many control frames are queued; inbound frames wait in the decoder.
    read_paused: bool,
    settings: StreamSettings,
    streams: Arc<ObjectPool<PerfStream>>,
    send_buffers: Arc<SendBufferPool>,
}

impl MuxSession {
    pub fn new(
        settings: StreamSettings,
        streams: Arc<ObjectPool<PerfStream>>,
        send_buffers: Arc<SendBufferPool>,
    ) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            table: StreamTable::new(),
            outbound: OutboundQueue::default(),
            starved: Vec::new(),
            draining: false,
            read_closed: false,
            read_paused: false,
            settings,
            streams,
            send_buffers,
        }
    }

    /// Read once from `reader` and process every complete frame.
    ///
    /// Returns the number of bytes read. At end of stream the session stops
    /// reading; streams still waiting for their request are aborted and the
    /// rest keep sending.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, ConnectionError> {
        let n = self.decoder.read_from(reader)?;
        if n == 0 {
            self.on_peer_eof();
            return Ok(0);
        }
        self.process()?;
        Ok(n)
    }

    fn on_peer_eof(&mut self) {
        self.read_closed = true;
        if self.decoder.buffered() > 0 {
            debug!(bytes = self.decoder.buffered(), "Peer closed mid-frame");
        }
        let waiting: Vec<u32> = self
            .table
            .ids()
            .filter(|&id| {
                self.table
                    .get(id)
                    .is_some_and(|stream| !stream.is_recv_shutdown())
            })
            .collect();
        for id in waiting {
            trace!(stream_id = id, "Peer closed before fin, aborting stream");
            if let Some(stream) = self.table.get_mut(id) {
                stream.abort();
            }
            self.outbound.purge(id);
            self.retire(id);
            self.outbound.push_control(id, FrameFlags::abort());
        }
    }

    /// Feed raw bytes as if read from the socket.
    #[cfg(test)]
    pub fn receive(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.decoder.extend(data);
        self.process()
    }

    /// Handle buffered frames until the decoder runs dry or reading pauses.
    pub fn process(&mut self) -> Result<(), ProtocolError> {
        while !self.read_paused {
            let Some(frame) = self.decoder.decode()? else {
                break;
            };
            self.handle_frame(frame)?;
            if self.outbound.control_len() >= CONTROL_HIGH_WATER {
                debug!(
                    queued = self.outbound.control_len(),
                    "Control frames backed up, pausing reads"
                );
                self.read_paused = true;
            }
        }
        Ok(())
    }

    /// Apply one inbound frame.
    ///
    /// Only connection-scope protocol errors are returned; stream-scope
    /// failures abort that stream and are answered with an abort frame.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let id = frame.stream_id;
        let flags = frame.flags;

        if flags.open {
            if self.draining {
                debug!(stream_id = id, "Refusing stream while draining");
                if self.table.lookup(id) == Slot::Unknown {
                    self.table.retire(id);
                }
                self.outbound.push_control(id, FrameFlags::abort());
                return Ok(());
            }
            match self.table.claim(id) {
                Ok(()) => {}
                Err(e) if e.is_connection_scope() => return Err(e),
                Err(e) => {
                    debug!(stream_id = id, error = %e, "Rejecting stream open");
                    self.outbound.push_control(id, FrameFlags::abort());
                    return Ok(());
                }
            }
            let Some(mut stream) = self.streams.acquire() else {
                warn!(stream_id = id, "Stream pool exhausted, aborting stream");
                self.table.retire(id);
                self.outbound.push_control(id, FrameFlags::abort());
                return Ok(());
            };
            stream.open(&self.settings, StreamKind::Bidirectional);
            self.table.insert(id, stream);
            trace!(stream_id = id, "Stream opened");
        }

        match self.table.lookup(id) {
            Slot::Live => {}
            // Late frames for a retired stream: data is dropped, fin and
            // abort are no-ops.
            Slot::Retired => return Ok(()),
            Slot::Unknown if flags.abort => return Ok(()),
            Slot::Unknown => {
                let error = ProtocolError::UnknownStream(id);
                debug!(stream_id = id, error = %error, "Dropping frame");
                self.outbound.push_control(id, FrameFlags::abort());
                return Ok(());
            }
        }

        if flags.abort {
            trace!(stream_id = id, "Stream aborted by peer");
            self.outbound.purge(id);
            self.retire(id);
            return Ok(());
        }

        let result = match self.table.get_mut(id) {
            Some(stream) => {
                if stream.is_recv_shutdown() && !frame.payload.is_empty() {
                    debug!(
                        stream_id = id,
                        bytes = frame.payload.len(),
                        "Discarding data after fin"
                    );
                }
                stream.on_receive(&frame.payload).and_then(|()| {
                    if flags.fin {
                        stream.on_recv_shutdown()
                    } else {
                        Ok(())
                    }
                })
            }
            None => Ok(()),
        };
        match result {
            Ok(()) => self.drive(id),
            Err(e) => self.abort_stream(id, &e),
        }
        Ok(())
    }

    /// Run the response engine for one stream.
    fn drive(&mut self, id: u32) {
        let Some(stream) = self.table.get_mut(id) else {
            return;
        };
        let mut sink = FrameSink {
            stream_id: id,
            queue: &mut self.outbound,
        };
        match engine::drive(stream, &self.send_buffers, &mut sink) {
            Progress::Waiting => {}
            Progress::Starved => {
                if !self.starved.contains(&id) {
                    self.starved.push(id);
                }
            }
            Progress::Closed => self.retire(id),
        }
    }

    /// Remove a closed stream and return its state to the pool.
    fn retire(&mut self, id: u32) {
        if let Some(stream) = self.table.remove(id) {
            trace!(
                stream_id = id,
                send_state = ?stream.send_state(),
                recv_state = ?stream.recv_state(),
                aborted = stream.is_aborted(),
                response_size = stream.response_size(),
                bytes_sent = stream.bytes_sent(),
                bytes_received = stream.bytes_received(),
                "Stream retired"
            );
        }
    }

    /// Abort a stream after a stream-scope failure and tell the peer.
    fn abort_stream(&mut self, id: u32, error: &ProtocolError) {
        debug!(stream_id = id, error = %error, "Aborting stream");
        if let Some(stream) = self.table.get_mut(id) {
            stream.abort();
        }
        self.outbound.purge(id);
        self.retire(id);
        self.outbound.push_control(id, FrameFlags::abort());
    }

    /// Attribute a batch of send completions to their streams.
    pub fn complete(&mut self, completed: &[(u32, usize)]) {
        let mut touched: Vec<u32> = Vec::new();
        for &(id, len) in completed {
            if let Some(stream) = self.table.get_mut(id) {
                stream.on_send_complete(len);
                if !touched.contains(&id) {
                    touched.push(id);
                }
            }
        }
        for id in touched {
            self.drive(id);
        }
    }

    /// Write queued frames and process the resulting completions.
    ///
    /// Completions can queue more frames, so this keeps writing until the
    /// queue is empty or the writer would block.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        loop {
            let mut completed = Vec::new();
            let result = self.outbound.flush(writer, &mut completed);
            self.complete(&completed);
            if self.read_paused && self.outbound.control_len() < CONTROL_LOW_WATER {
                trace!("Control frames drained, resuming reads");
                self.read_paused = false;
            }
            result?;
            if completed.is_empty() || self.outbound.is_empty() {
                return Ok(());
            }
        }
    }

    /// Retry streams that were starved of send descriptors.
    pub fn retry_starved(&mut self) {
        for id in std::mem::take(&mut self.starved) {
            self.drive(id);
        }
    }

    pub fn is_starved(&self) -> bool {
        !self.starved.is_empty()
    }

    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Whether the socket should be read.
    pub fn wants_read(&self) -> bool {
        !self.read_closed && !self.read_paused
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    /// The peer is done sending and every response has been written.
    pub fn is_finished(&self) -> bool {
        self.read_closed && self.is_idle()
    }

    /// No live streams and nothing left to write.
    pub fn is_idle(&self) -> bool {
        self.table.is_empty() && self.outbound.is_empty()
    }

    /// Stop accepting new streams; existing ones run to completion.
    pub fn start_draining(&mut self) {
        self.draining = true;
    }

    pub fn stream_count(&self) -> usize {
        self.table.len()
    }

    /// Force-retire every stream.
    pub fn close(&mut self) {
        let retired = self.table.drain().count();
        self.outbound = OutboundQueue::default();
        self.starved.clear();
        if retired > 0 {
            debug!(streams = retired, "Force-retired streams");
        }
    }
}

/// A TCP connection owned by a worker.
pub struct TcpConnection {
    pub socket: TcpStream,
    pub peer: SocketAddr,
    pub session: MuxSession,
    /// Interest currently registered with the poller.
    pub interest: Interest,
}

impl TcpConnection {
    pub fn new(socket: TcpStream, peer: SocketAddr, session: MuxSession) -> Self {
        if let Err(e) = socket.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        Self {
            socket,
            peer,
            session,
            interest: Interest::READABLE,
        }
    }

    /// Read until the socket would block, the peer closes its side, or
    /// reading pauses.
    pub fn on_readable(&mut self) -> Result<(), ConnectionError> {
        // Frames left in the decoder by an earlier pause go first.
        self.session.process()?;
        while self.session.wants_read() {
            match self.session.read_from(&mut self.socket) {
                Ok(_) => {}
                Err(ConnectionError::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(());
                }
                Err(ConnectionError::Io(ref e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ConnectionError> {
        self.session.flush(&mut self.socket)?;
        Ok(())
    }

    /// Read (if `readable`) and write until neither side can progress.
    ///
    /// Reads paused on backed-up control frames resume as soon as a flush
    /// drains them; edge-triggered readiness will not fire again for data
    /// already waiting in the socket, so the socket is read right away.
    pub fn service(&mut self, readable: bool) -> Result<(), ConnectionError> {
        let mut readable = readable;
        loop {
            if readable {
                self.on_readable()?;
            }
            let paused = self.session.is_read_paused();
            self.flush()?;
            if paused && !self.session.is_read_paused() {
                readable = true;
                continue;
            }
            return Ok(());
        }
    }

    /// Interest the connection should be registered with.
    ///
    /// Readable until the peer closes its side, writable while frames are
    /// queued. A half-closed connection keeps writable interest alone.
    pub fn desired_interest(&self) -> Interest {
        match (self.session.is_read_closed(), self.session.wants_write()) {
            (false, false) => Interest::READABLE,
            (false, true) => Interest::READABLE | Interest::WRITABLE,
            (true, _) => Interest::WRITABLE,
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.session.close();
    }
}
