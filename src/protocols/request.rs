//! Request header parser.
//!
//! Every stream starts with a fixed-size, versioned header describing the
//! response the client wants back:
//!
//! ```text
//! offset  size  field
//!      0     1  version (currently 1)
//!      1     1  flags: bit 0 = unidirectional, bits 1-7 reserved (zero)
//!      2     6  reserved (zero)
//!      8     8  response size in bytes, big-endian u64
//! ```
//!
//! A unidirectional request asks the server to send the response without
//! reading anything else from the stream. Bytes following the header on a
//! bidirectional stream are upload payload and are discarded.

use crate::error::ProtocolError;
use bytes::Buf;

/// Size of the request header on the wire.
pub const HEADER_LEN: usize = 16;

/// Header version understood by this server.
pub const VERSION: u8 = 1;

const FLAG_UNIDIRECTIONAL: u8 = 0x01;

/// Parsed request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Number of response bytes the server must send.
    pub response_size: u64,
    /// Serve the response without reading further request bytes.
    pub unidirectional: bool,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// A complete header was parsed.
    Complete(Request),
    /// Fewer than `HEADER_LEN` bytes are available.
    Incomplete,
    /// The header is malformed.
    Invalid(ProtocolError),
}

/// Parse a request header from the start of `input`.
///
/// Only the first `HEADER_LEN` bytes are examined.
pub fn parse(input: &[u8]) -> ParseResult {
    if input.len() < HEADER_LEN {
        return ParseResult::Incomplete;
    }

    let mut header = &input[..HEADER_LEN];
    let version = header.get_u8();
    if version != VERSION {
        return ParseResult::Invalid(ProtocolError::UnsupportedVersion(version));
    }

    let flags = header.get_u8();
    if flags & !FLAG_UNIDIRECTIONAL != 0 {
        return ParseResult::Invalid(ProtocolError::ReservedBits);
    }

    let reserved = &header[..6];
    if reserved.iter().any(|&b| b != 0) {
        return ParseResult::Invalid(ProtocolError::ReservedBits);
    }
    header.advance(6);

    ParseResult::Complete(Request {
        response_size: header.get_u64(),
        unidirectional: flags & FLAG_UNIDIRECTIONAL != 0,
    })
}

impl Request {
    /// Encode the header as a client would send it.
    #[cfg(test)]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = VERSION;
        out[1] = if self.unidirectional {
            FLAG_UNIDIRECTIONAL
        } else {
            0
        };
        out[8..].copy_from_slice(&self.response_size.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let mut input = [0u8; HEADER_LEN];
        input[0] = 1;
        input[8..].copy_from_slice(&1_000_000u64.to_be_bytes());

        match parse(&input) {
            ParseResult::Complete(req) => {
                assert_eq!(req.response_size, 1_000_000);
                assert!(!req.unidirectional);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unidirectional() {
        let req = Request {
            response_size: 42,
            unidirectional: true,
        };
        match parse(&req.encode()) {
            ParseResult::Complete(parsed) => assert_eq!(parsed, req),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut input = Request {
            response_size: 7,
            unidirectional: false,
        }
        .encode()
        .to_vec();
        input.extend_from_slice(b"upload payload");

        assert!(matches!(
            parse(&input),
            ParseResult::Complete(Request {
                response_size: 7,
                ..
            })
        ));
    }

    #[test]
    fn test_incomplete() {
        match parse(&[1, 0, 0, 0]) {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_version() {
        let mut input = [0u8; HEADER_LEN];
        input[0] = 2;
        match parse(&input) {
            ParseResult::Invalid(ProtocolError::UnsupportedVersion(2)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reserved_bits() {
        let mut input = [0u8; HEADER_LEN];
        input[0] = 1;
        input[1] = 0x80;
        assert!(matches!(
            parse(&input),
            ParseResult::Invalid(ProtocolError::ReservedBits)
        ));

        let mut input = [0u8; HEADER_LEN];
        input[0] = 1;
        input[5] = 1;
        assert!(matches!(
            parse(&input),
            ParseResult::Invalid(ProtocolError::ReservedBits)
        ));
    }
}
