//! Multiplexing frame codec.
//!
//! Frames are length-prefixed so boundaries survive arbitrary segmentation
//! of the underlying byte stream:
//!
//! ```text
//! stream_id: u32 | flags: u8 | length: u32 | payload: [u8; length]
//! ```
//!
//! All integers are big-endian.

use crate::error::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read};

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest payload accepted in a single frame.
pub const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 64 * 1024;

/// Per-frame stream events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// First frame for this stream identifier.
    pub open: bool,
    /// Sender finished this direction.
    pub fin: bool,
    /// Abnormal termination of the stream.
    pub abort: bool,
}

impl FrameFlags {
    const OPEN: u8 = 0x01;
    const FIN: u8 = 0x02;
    const ABORT: u8 = 0x04;

    /// Flags for a frame carrying only a fin.
    pub fn fin() -> Self {
        Self {
            fin: true,
            ..Self::default()
        }
    }

    /// Flags for a frame carrying only an abort.
    pub fn abort() -> Self {
        Self {
            abort: true,
            ..Self::default()
        }
    }

    /// Decode the flags byte, rejecting reserved bits.
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        if bits & !(Self::OPEN | Self::FIN | Self::ABORT) != 0 {
            return Err(ProtocolError::InvalidFrameFlags(bits));
        }
        Ok(Self {
            open: bits & Self::OPEN != 0,
            fin: bits & Self::FIN != 0,
            abort: bits & Self::ABORT != 0,
        })
    }

    /// Encode the flags byte.
    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.open {
            bits |= Self::OPEN;
        }
        if self.fin {
            bits |= Self::FIN;
        }
        if self.abort {
            bits |= Self::ABORT;
        }
        bits
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

/// Encode a frame header for a payload of `len` bytes.
pub fn encode_header(stream_id: u32, flags: FrameFlags, len: u32) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&stream_id.to_be_bytes());
    header[4] = flags.bits();
    header[5..].copy_from_slice(&len.to_be_bytes());
    header
}

/// Incremental frame decoder.
///
/// Accumulates raw bytes from the connection and yields complete frames.
/// Payloads are split off the accumulation buffer without copying.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Socket reads land here first; allocated and zeroed once.
    scratch: Box<[u8]>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Read once from `reader` into the accumulation buffer.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let n = reader.read(&mut self.scratch)?;
        self.buf.extend_from_slice(&self.scratch[..n]);
        Ok(n)
    }

    /// Append raw bytes to the accumulation buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if any.
    ///
    /// Errors are connection-scope: once framing is violated the rest of
    /// the byte stream cannot be interpreted.
    pub fn decode(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &self.buf[..FRAME_HEADER_LEN];
        let stream_id = header.get_u32();
        let flags = FrameFlags::from_bits(header.get_u8())?;
        let len = header.get_u32();
        if len > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let total = FRAME_HEADER_LEN + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len as usize).freeze();

        Ok(Some(Frame {
            stream_id,
            flags,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(stream_id: u32, flags: FrameFlags, payload: &[u8]) -> Vec<u8> {
        let mut out = encode_header(stream_id, flags, payload.len() as u32).to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_flags_bits() {
        let flags = FrameFlags {
            open: true,
            fin: true,
            abort: false,
        };
        assert_eq!(flags.bits(), 0x03);
        assert_eq!(FrameFlags::from_bits(0x03).unwrap(), flags);
        assert_eq!(FrameFlags::abort().bits(), 0x04);
        assert_eq!(
            FrameFlags::from_bits(0x08),
            Err(ProtocolError::InvalidFrameFlags(0x08))
        );
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame_bytes(
            7,
            FrameFlags {
                open: true,
                ..FrameFlags::default()
            },
            b"hello",
        ));

        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.stream_id, 7);
        assert!(frame.flags.open);
        assert!(!frame.flags.fin);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut wire = frame_bytes(1, FrameFlags::default(), b"first");
        wire.extend(frame_bytes(2, FrameFlags::fin(), b""));
        wire.extend(frame_bytes(1, FrameFlags::fin(), b"second"));

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in wire {
            decoder.extend(&[byte]);
            while let Some(frame) = decoder.decode().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].stream_id, 1);
        assert_eq!(&frames[0].payload[..], b"first");
        assert_eq!(frames[1].stream_id, 2);
        assert!(frames[1].flags.fin);
        assert!(frames[1].payload.is_empty());
        assert_eq!(&frames[2].payload[..], b"second");
    }

    #[test]
    fn test_decode_invalid_flags() {
        let mut wire = frame_bytes(1, FrameFlags::default(), b"");
        wire[4] = 0xF0;
        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);
        assert_eq!(decoder.decode(), Err(ProtocolError::InvalidFrameFlags(0xF0)));
    }

    #[test]
    fn test_decode_oversized_frame() {
        let header = encode_header(1, FrameFlags::default(), MAX_FRAME_PAYLOAD + 1);
        let mut decoder = FrameDecoder::new();
        decoder.extend(&header);
        assert_eq!(
            decoder.decode(),
            Err(ProtocolError::FrameTooLarge(MAX_FRAME_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_read_from_reader() {
        let wire = frame_bytes(9, FrameFlags::fin(), b"abc");
        let mut reader = &wire[..];
        let mut decoder = FrameDecoder::new();

        assert_eq!(decoder.read_from(&mut reader).unwrap(), wire.len());
        assert_eq!(decoder.read_from(&mut reader).unwrap(), 0);

        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.stream_id, 9);
        assert_eq!(&frame.payload[..], b"abc");
    }

    /// Yields its chunks one read at a time, then would block.
    struct Segmented(Vec<Vec<u8>>);

    impl Read for Segmented {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_read_from_accumulates() {
        let payload = vec![5u8; READ_CHUNK + 100];
        let wire = frame_bytes(3, FrameFlags::default(), &payload);
        let (first, rest) = wire.split_at(READ_CHUNK);
        let mut reader = Segmented(vec![first.to_vec(), rest.to_vec()]);
        let mut decoder = FrameDecoder::default();

        assert_eq!(decoder.read_from(&mut reader).unwrap(), READ_CHUNK);
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.read_from(&mut reader).unwrap(), rest.len());

        // A failed read keeps what was already buffered.
        let err = decoder.read_from(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.stream_id, 3);
        assert_eq!(frame.payload.len(), payload.len());
        assert!(decoder.decode().unwrap().is_none());
    }
}
