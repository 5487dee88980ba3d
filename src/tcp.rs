//! Muxers over plain TCP.
//!
//! The dialing side is the muxer [`Role::Client`], the listening side
//! [`Role::Server`]. Nagle is disabled on every connection since frames are
//! flushed one at a time.
//!
//! # Example
//!
//! ```rust,ignore
//! use spdy_mux::{tcp, Config};
//!
//! let listener = tcp::MuxListener::bind("127.0.0.1:7000", Config::default()).await?;
//! tokio::spawn(async move {
//!     let (muxer, _addr) = listener.accept().await?;
//!     let stream = muxer.accept().await?;
//!     // ...
//! });
//!
//! let muxer = tcp::dial("127.0.0.1:7000", Config::default()).await?;
//! let stream = muxer.open()?;
//! stream.write(b"hello").await?;
//! ```

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::muxer::{Muxer, Role};

/// Connect to `addr` and start a client muxer on the connection.
pub async fn dial<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Muxer> {
    config.validate()?;

    let socket = TcpStream::connect(addr).await?;
    if let Err(e) = socket.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    debug!("Dialed {:?}", socket.peer_addr().ok());

    Muxer::new(socket, Role::Client, config)
}

/// Accepts TCP connections and wraps each in a server muxer.
pub struct MuxListener {
    listener: TcpListener,
    config: Config,
}

impl MuxListener {
    /// Bind to `addr`. The config is applied to every accepted connection.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        Ok(Self { listener, config })
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<(Muxer, SocketAddr)> {
        let (socket, peer) = self.listener.accept().await?;
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        debug!("Accepted connection from {}", peer);

        let muxer = Muxer::new(socket, Role::Server, self.config.clone())?;
        Ok((muxer, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
