//! Error taxonomy for the perf server.
//!
//! Errors are scoped: a [`ProtocolError`] or [`StreamError`] ends one stream,
//! a [`ConnectionError`] tears down one byte-stream connection, and only an
//! [`InitError`] is fatal to the process.

use crate::config::ConfigError;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Violations of the request header or the multiplexing frame format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("request header truncated ({received} of {expected} bytes)")]
    ShortHeader { received: usize, expected: usize },
    #[error("unsupported request header version {0}")]
    UnsupportedVersion(u8),
    #[error("reserved request header bits set")]
    ReservedBits,
    #[error("receive-only stream requested a {0} byte response")]
    ResponseOnReceiveOnly(u64),
    #[error("frame for unknown stream {0}")]
    UnknownStream(u32),
    #[error("stream {0} opened while still open")]
    DuplicateOpen(u32),
    #[error("stream {0} reuses a retired identifier")]
    IdentifierReuse(u32),
    #[error("invalid frame flags {0:#04x}")]
    InvalidFrameFlags(u8),
    #[error("frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
}

impl ProtocolError {
    /// Whether the error invalidates the whole connection rather than one stream.
    ///
    /// Framing errors leave the byte stream unparseable, and a duplicate open
    /// means the peer's view of the stream table has diverged from ours.
    pub fn is_connection_scope(&self) -> bool {
        matches!(
            self,
            ProtocolError::DuplicateOpen(_)
                | ProtocolError::InvalidFrameFlags(_)
                | ProtocolError::FrameTooLarge(_)
        )
    }
}

/// Why a single stream ended abnormally.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{0} pool exhausted")]
    ResourceExhausted(&'static str),
    #[error("peer stopped the stream")]
    PeerStopped,
    #[error(transparent)]
    Read(#[from] quinn::ReadError),
    #[error(transparent)]
    Write(#[from] quinn::WriteError),
    #[error(transparent)]
    Closed(#[from] quinn::ClosedStream),
    #[error(transparent)]
    Connection(#[from] quinn::ConnectionError),
}

impl StreamError {
    /// Whether the peer (or the connection going away) ended the stream.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            StreamError::Read(quinn::ReadError::Reset(_))
                | StreamError::Read(quinn::ReadError::ConnectionLost(_))
                | StreamError::Write(quinn::WriteError::Stopped(_))
                | StreamError::Write(quinn::WriteError::ConnectionLost(_))
                | StreamError::PeerStopped
                | StreamError::Connection(_)
        )
    }
}

/// Failures that end one byte-stream connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Unrecoverable startup failures.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read credentials from '{}': {source}", .path.display())]
    Credentials { path: PathBuf, source: io::Error },
    #[error("no private key found in '{}'", .0.display())]
    MissingKey(PathBuf),
    #[error("self-signed certificate generation failed: {0}")]
    SelfSign(#[from] rcgen::Error),
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
    #[error("QUIC crypto setup failed: {0}")]
    QuicCrypto(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
    #[error("invalid transport setting: {0}")]
    TransportSetting(String),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}
