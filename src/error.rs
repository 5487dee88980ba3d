use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur in muxer and stream operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error outside the muxer's shared connection (codec helpers, TCP setup)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame could not be decoded; the connection can no longer be trusted
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The physical connection failed; shared by every stream on it
    #[error("Transport error: {0}")]
    Transport(Arc<io::Error>),

    /// Operation on a stream that was closed locally or by the peer
    #[error("Stream closed")]
    StreamClosed,

    /// Duplicate close
    #[error("Stream already closed")]
    AlreadyClosed,

    /// Peer sent FIN and every buffered byte has been read
    #[error("End of stream")]
    EndOfStream,

    /// The muxer was closed locally
    #[error("Connection closed")]
    ConnectionClosed,

    /// Frame payload too large
    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    /// Peer sent more data than it had credit for
    #[error("Flow control violation on stream {id}: {len} bytes exceeds remaining window {window}")]
    FlowControl { id: u32, len: usize, window: usize },

    /// No unused stream ids left on this muxer
    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    /// Timeout waiting for operation
    #[error("Operation timed out")]
    Timeout,

    /// Rejected configuration value
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this is the clean end of a stream rather than a failure.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::Io(e) => e.kind(),
            Error::Transport(e) => e.kind(),
            Error::MalformedFrame(_) | Error::FlowControl { .. } => io::ErrorKind::InvalidData,
            Error::StreamClosed | Error::AlreadyClosed => io::ErrorKind::BrokenPipe,
            Error::EndOfStream => io::ErrorKind::UnexpectedEof,
            Error::ConnectionClosed => io::ErrorKind::ConnectionAborted,
            Error::FrameTooLarge(..) | Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            Error::StreamIdsExhausted => io::ErrorKind::Other,
            Error::Timeout => io::ErrorKind::TimedOut,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
