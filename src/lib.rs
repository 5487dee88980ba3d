//! Stream multiplexing over a single reliable connection
//!
//! This crate runs many independent, bidirectional byte streams over one
//! ordered connection (TCP, or anything else that reads and writes bytes in
//! order). It allows applications to:
//!
//! - Open streams from either end without a round trip
//! - Use standard Rust async I/O traits (AsyncRead, AsyncWrite)
//! - Avoid head-of-line blocking between streams: each stream has its own
//!   flow control window, so a slow reader only stalls its own sender
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓
//! Stream (per-stream buffers, credit)
//!     ↓
//! Muxer (stream table, dispatch loop, writer task)
//!     ↓
//! Transport (TCP, TLS, WebSocket, in-memory pipe)
//! ```
//!
//! Every frame is `[flag u8][stream id u32][length u16][payload]`, big
//! endian. A stream is announced by its first DATA-carrying SYN frame and
//! ended by FIN; WINDOW_UPDATE frames return receive credit.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use spdy_mux::{Config, Muxer};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//!     let muxer = Muxer::client(socket, Config::default())?;
//!
//!     // Open a stream; the peer sees it on the first write
//!     let mut stream = muxer.open()?;
//!     stream.write_all(b"hello").await?;
//!
//!     // Use standard async I/O
//!     let mut buf = vec![0u8; 1024];
//!     let n = stream.read(&mut buf).await?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod muxer;
pub mod protocol;
pub mod stream;
pub mod tcp;
pub mod transport;

// Re-export main types
pub use config::{Config, DEFAULT_ACCEPT_BACKLOG};
pub use error::{Error, Result};
pub use muxer::{Muxer, Role};
pub use protocol::{Flag, Frame, DEFAULT_WINDOW_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use stream::{Stream, StreamState};
pub use tcp::{dial, MuxListener};
pub use transport::Transport;
