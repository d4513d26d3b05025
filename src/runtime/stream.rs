//! Per-stream life cycle.
//!
//! A [`PerfStream`] tracks one logical stream from open to retirement:
//! it accumulates the request header, records the requested response size,
//! and accounts for every response byte submitted and completed. It never
//! touches a transport; [`engine::drive`](super::engine::drive) turns its
//! state into chunks for a backend.
//!
//! Send side: `Open -> AwaitingRequestComplete -> RequestParsed -> Sending
//! -> SendShutdown`. Receive side: `RecvOpen -> RecvShutdown`. The stream
//! is closed once both sides are shut, or immediately on abort.

use crate::error::ProtocolError;
use crate::protocols::request::{self, ParseResult, HEADER_LEN};
use crate::runtime::pool::Recycle;
use bytes::BytesMut;

/// Default largest chunk submitted in one send.
pub const DEFAULT_IO_SIZE: u32 = 64 * 1024;

/// Default bytes allowed in flight per stream.
pub const DEFAULT_IDEAL_SEND_BUFFER: u64 = 128 * 1024;

/// Send settings applied to every new stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub io_size: u32,
    pub ideal_send_buffer: u64,
    /// Keep exactly one send outstanding per stream.
    pub buffered_io: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            io_size: DEFAULT_IO_SIZE,
            ideal_send_buffer: DEFAULT_IDEAL_SEND_BUFFER,
            buffered_io: false,
        }
    }
}

/// Directions a stream was opened with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamKind {
    /// Request in, response out.
    #[default]
    Bidirectional,
    /// Peer-initiated upload sink; the send side is shut from the start.
    ReceiveOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Open,
    AwaitingRequestComplete,
    RequestParsed,
    Sending,
    SendShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    RecvOpen,
    RecvShutdown,
}

/// State of one logical stream.
#[derive(Debug)]
pub struct PerfStream {
    kind: StreamKind,
    io_size: u32,
    ideal_send_buffer: u64,
    buffered_io: bool,
    unidirectional: bool,
    response_size_set: bool,
    response_size: u64,
    bytes_sent: u64,
    outstanding_bytes: u64,
    bytes_received: u64,
    send_shutdown: bool,
    recv_shutdown: bool,
    aborted: bool,
    /// Partially received request header.
    header: BytesMut,
}

impl Default for PerfStream {
    fn default() -> Self {
        Self {
            kind: StreamKind::Bidirectional,
            io_size: DEFAULT_IO_SIZE,
            ideal_send_buffer: DEFAULT_IDEAL_SEND_BUFFER,
            buffered_io: false,
            unidirectional: false,
            response_size_set: false,
            response_size: 0,
            bytes_sent: 0,
            outstanding_bytes: 0,
            bytes_received: 0,
            send_shutdown: false,
            recv_shutdown: false,
            aborted: false,
            header: BytesMut::new(),
        }
    }
}

impl Recycle for PerfStream {
    fn recycle(&mut self) {
        let mut header = std::mem::take(&mut self.header);
        header.clear();
        *self = Self {
            header,
            ..Self::default()
        };
    }
}

impl PerfStream {
    /// Initialize a freshly acquired stream.
    pub fn open(&mut self, settings: &StreamSettings, kind: StreamKind) {
        self.kind = kind;
        self.io_size = settings.io_size;
        self.buffered_io = settings.buffered_io;
        self.ideal_send_buffer = if settings.buffered_io {
            1
        } else {
            settings.ideal_send_buffer
        };
        self.send_shutdown = kind == StreamKind::ReceiveOnly;
    }

    /// Feed bytes received from the peer.
    ///
    /// Bytes complete the request header first; anything after it is upload
    /// payload and is counted, then discarded. Once the receive side is shut
    /// (unidirectional requests shut it as soon as the header parses) further
    /// bytes are ignored.
    pub fn on_receive(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.aborted {
            return Ok(());
        }
        self.bytes_received += data.len() as u64;
        if self.response_size_set {
            return Ok(());
        }

        let take = (HEADER_LEN - self.header.len()).min(data.len());
        self.header.extend_from_slice(&data[..take]);

        match request::parse(&self.header) {
            ParseResult::Incomplete => Ok(()),
            ParseResult::Invalid(e) => Err(e),
            ParseResult::Complete(req) => {
                if self.kind == StreamKind::ReceiveOnly && req.response_size > 0 {
                    return Err(ProtocolError::ResponseOnReceiveOnly(req.response_size));
                }
                self.response_size = req.response_size;
                self.unidirectional = req.unidirectional;
                self.response_size_set = true;
                if self.unidirectional {
                    self.recv_shutdown = true;
                }
                Ok(())
            }
        }
    }

    /// The peer finished its send direction.
    ///
    /// Idempotent. Fails if the request header never completed.
    pub fn on_recv_shutdown(&mut self) -> Result<(), ProtocolError> {
        if self.recv_shutdown || self.aborted {
            return Ok(());
        }
        if !self.response_size_set {
            return Err(ProtocolError::ShortHeader {
                received: self.header.len(),
                expected: HEADER_LEN,
            });
        }
        self.recv_shutdown = true;
        Ok(())
    }

    /// Terminate the stream abnormally. Idempotent.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    fn can_send(&self) -> bool {
        self.response_size_set && self.recv_shutdown && !self.send_shutdown && !self.aborted
    }

    /// Length of the next chunk to submit, if the window allows one.
    ///
    /// Bounded by `io_size`, the bytes still owed, and the room left under
    /// `ideal_send_buffer`.
    ///
    /// In buffered mode `ideal_send_buffer` is 1 and counts sends, not
    /// bytes: one send may be in flight, carrying up to `io_size` bytes, so
    /// `outstanding_bytes` can exceed `ideal_send_buffer` there.
    pub fn next_chunk_len(&self) -> Option<usize> {
        if !self.can_send() {
            return None;
        }
        let remaining = self.response_size - self.bytes_sent;
        let window = if self.buffered_io {
            if self.outstanding_bytes > 0 {
                0
            } else {
                u64::from(self.io_size)
            }
        } else {
            self.ideal_send_buffer.saturating_sub(self.outstanding_bytes)
        };
        let len = u64::from(self.io_size).min(remaining).min(window);
        (len > 0).then_some(len as usize)
    }

    /// Account for a chunk handed to the transport.
    pub fn on_submit(&mut self, len: usize) {
        let len = len as u64;
        debug_assert!(self.bytes_sent + len <= self.response_size);
        self.bytes_sent += len;
        self.outstanding_bytes += len;
    }

    /// Account for a chunk the transport finished with.
    pub fn on_send_complete(&mut self, len: usize) {
        let len = len as u64;
        debug_assert!(len <= self.outstanding_bytes);
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(len);
    }

    /// Whether every response byte has completed and the send side should
    /// now be shut.
    pub fn should_shutdown_send(&self) -> bool {
        self.can_send() && self.bytes_sent == self.response_size && self.outstanding_bytes == 0
    }

    /// Mark the send side shut. Idempotent.
    pub fn shutdown_send(&mut self) {
        self.send_shutdown = true;
    }

    /// Both sides shut, or aborted. The stream may be retired.
    pub fn is_closed(&self) -> bool {
        self.aborted || (self.send_shutdown && self.recv_shutdown)
    }

    pub fn send_state(&self) -> SendState {
        if self.send_shutdown {
            SendState::SendShutdown
        } else if !self.response_size_set {
            if self.header.is_empty() {
                SendState::Open
            } else {
                SendState::AwaitingRequestComplete
            }
        } else if !self.recv_shutdown {
            SendState::RequestParsed
        } else {
            SendState::Sending
        }
    }

    pub fn recv_state(&self) -> RecvState {
        if self.recv_shutdown {
            RecvState::RecvShutdown
        } else {
            RecvState::RecvOpen
        }
    }

    #[cfg(test)]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    #[cfg(test)]
    pub fn io_size(&self) -> u32 {
        self.io_size
    }

    #[cfg(test)]
    pub fn ideal_send_buffer(&self) -> u64 {
        self.ideal_send_buffer
    }

    #[cfg(test)]
    pub fn buffered_io(&self) -> bool {
        self.buffered_io
    }

    pub fn unidirectional(&self) -> bool {
        self.unidirectional
    }

    #[cfg(test)]
    pub fn response_size_set(&self) -> bool {
        self.response_size_set
    }

    pub fn response_size(&self) -> u64 {
        self.response_size
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[cfg(test)]
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    #[cfg(test)]
    pub fn is_send_shutdown(&self) -> bool {
        self.send_shutdown
    }

    pub fn is_recv_shutdown(&self) -> bool {
        self.recv_shutdown
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::request::Request;

    fn header(response_size: u64, unidirectional: bool) -> [u8; HEADER_LEN] {
        Request {
            response_size,
            unidirectional,
        }
        .encode()
    }

    fn open(settings: StreamSettings) -> PerfStream {
        let mut stream = PerfStream::default();
        stream.open(&settings, StreamKind::Bidirectional);
        stream
    }

    #[test]
    fn test_request_lifecycle() {
        let mut stream = open(StreamSettings::default());
        assert_eq!(stream.send_state(), SendState::Open);

        let req = header(10, false);
        stream.on_receive(&req[..5]).unwrap();
        assert_eq!(stream.send_state(), SendState::AwaitingRequestComplete);

        stream.on_receive(&req[5..]).unwrap();
        assert_eq!(stream.send_state(), SendState::RequestParsed);
        assert!(stream.response_size_set());
        assert_eq!(stream.response_size(), 10);
        assert_eq!(stream.next_chunk_len(), None);

        stream.on_recv_shutdown().unwrap();
        assert_eq!(stream.send_state(), SendState::Sending);
        assert_eq!(stream.recv_state(), RecvState::RecvShutdown);
        assert_eq!(stream.next_chunk_len(), Some(10));

        stream.on_submit(10);
        assert_eq!(stream.next_chunk_len(), None);
        assert!(!stream.should_shutdown_send());

        stream.on_send_complete(10);
        assert!(stream.should_shutdown_send());
        stream.shutdown_send();
        assert_eq!(stream.send_state(), SendState::SendShutdown);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_upload_payload_discarded() {
        let mut stream = open(StreamSettings::default());
        let mut input = header(0, false).to_vec();
        input.extend_from_slice(&[0xAB; 100]);

        stream.on_receive(&input).unwrap();
        stream.on_receive(&[0xCD; 50]).unwrap();
        assert_eq!(stream.bytes_received(), HEADER_LEN as u64 + 150);
        assert_eq!(stream.response_size(), 0);
        assert!(!stream.is_recv_shutdown());
    }

    #[test]
    fn test_unidirectional_implies_recv_shutdown() {
        let mut stream = open(StreamSettings::default());
        stream.on_receive(&header(100, true)).unwrap();

        assert!(stream.unidirectional());
        assert_eq!(stream.recv_state(), RecvState::RecvShutdown);
        assert_eq!(stream.next_chunk_len(), Some(100));

        // A later fin from the peer is harmless.
        stream.on_recv_shutdown().unwrap();
        assert!(stream.is_recv_shutdown());
    }

    #[test]
    fn test_short_header_on_fin() {
        let mut stream = open(StreamSettings::default());
        stream.on_receive(&[1, 0, 0]).unwrap();
        assert_eq!(
            stream.on_recv_shutdown(),
            Err(ProtocolError::ShortHeader {
                received: 3,
                expected: HEADER_LEN
            })
        );
    }

    #[test]
    fn test_malformed_header() {
        let mut stream = open(StreamSettings::default());
        let mut req = header(1, false);
        req[0] = 9;
        assert_eq!(
            stream.on_receive(&req),
            Err(ProtocolError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_window_bounds_chunks() {
        let mut stream = open(StreamSettings {
            io_size: 4096,
            ideal_send_buffer: 10_000,
            buffered_io: false,
        });
        stream.on_receive(&header(1_000_000, true)).unwrap();

        let mut submitted = Vec::new();
        while let Some(len) = stream.next_chunk_len() {
            stream.on_submit(len);
            submitted.push(len);
            assert!(stream.outstanding_bytes() <= stream.ideal_send_buffer());
        }
        // 4096 + 4096 + 1808 fills the 10_000 byte window exactly.
        assert_eq!(submitted, vec![4096, 4096, 1808]);
        assert_eq!(stream.outstanding_bytes(), 10_000);

        stream.on_send_complete(4096);
        assert_eq!(stream.next_chunk_len(), Some(4096));
    }

    #[test]
    fn test_buffered_io_single_send() {
        let mut stream = open(StreamSettings {
            io_size: 4096,
            ideal_send_buffer: 1 << 20,
            buffered_io: true,
        });
        assert_eq!(stream.ideal_send_buffer(), 1);
        stream.on_receive(&header(10_000, true)).unwrap();

        assert_eq!(stream.next_chunk_len(), Some(4096));
        stream.on_submit(4096);
        assert_eq!(stream.next_chunk_len(), None);

        stream.on_send_complete(4096);
        assert_eq!(stream.next_chunk_len(), Some(4096));
    }

    #[test]
    fn test_receive_only_stream() {
        let mut stream = PerfStream::default();
        stream.open(&StreamSettings::default(), StreamKind::ReceiveOnly);
        assert_eq!(stream.send_state(), SendState::SendShutdown);

        stream.on_receive(&header(0, false)).unwrap();
        stream.on_receive(&[0u8; 1000]).unwrap();
        assert!(!stream.is_closed());

        stream.on_recv_shutdown().unwrap();
        assert!(stream.is_closed());
        assert_eq!(stream.next_chunk_len(), None);

        let mut stream = PerfStream::default();
        stream.open(&StreamSettings::default(), StreamKind::ReceiveOnly);
        assert_eq!(
            stream.on_receive(&header(5, false)),
            Err(ProtocolError::ResponseOnReceiveOnly(5))
        );
    }

    #[test]
    fn test_abort_is_idempotent() {
        let mut stream = open(StreamSettings::default());
        stream.on_receive(&header(100, true)).unwrap();
        stream.abort();
        stream.abort();
        assert!(stream.is_closed());
        assert_eq!(stream.next_chunk_len(), None);
        assert!(!stream.should_shutdown_send());
        assert!(stream.on_recv_shutdown().is_ok());
    }

    #[test]
    fn test_recycle_resets_state() {
        let mut stream = open(StreamSettings {
            io_size: 1,
            ideal_send_buffer: 1,
            buffered_io: true,
        });
        stream.on_receive(&header(5, true)).unwrap();
        stream.on_submit(1);
        stream.abort();

        stream.recycle();
        assert_eq!(stream.send_state(), SendState::Open);
        assert_eq!(stream.recv_state(), RecvState::RecvOpen);
        assert_eq!(stream.bytes_sent(), 0);
        assert_eq!(stream.outstanding_bytes(), 0);
        assert!(!stream.is_aborted());
        assert!(!stream.buffered_io());
        assert_eq!(stream.io_size(), DEFAULT_IO_SIZE);
    }
}
