//! The byte stream a [`Muxer`](crate::Muxer) runs on.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// An established, ordered, reliable byte stream.
///
/// TLS and WebSocket upgrades happen before the transport is handed to a
/// muxer; anything that reads and writes bytes in order qualifies. Address
/// accessors are passed through to every [`Stream`](crate::Stream).
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// In-memory pipe, mostly for tests.
impl Transport for DuplexStream {}
