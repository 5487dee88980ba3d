//! Simple echo server example
//!
//! Accepts TCP connections, then every stream on them, and echoes back any
//! data received.
//!
//! Usage: `cargo run --example echo [listen_addr]` (default 127.0.0.1:7000)

use spdy_mux::{Config, Muxer, MuxListener, Stream};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,spdy_mux=debug")
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string());

    let listener = MuxListener::bind(addr.as_str(), Config::default()).await?;
    info!("Echo server listening on {}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((muxer, peer)) => {
                info!("Accepted connection from {}", peer);
                tokio::spawn(serve_connection(Arc::new(muxer)));
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                break;
            }
        }
    }

    Ok(())
}

async fn serve_connection(muxer: Arc<Muxer>) {
    loop {
        match muxer.accept().await {
            Ok(stream) => {
                info!("Accepted stream {} from {:?}", stream.id(), stream.peer_addr());

                // Spawn a task to handle this stream
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(stream).await {
                        error!("Stream error: {}", e);
                    }
                });
            }
            Err(e) => {
                info!("Connection ended: {}", e);
                break;
            }
        }
    }
}

async fn handle_stream(mut stream: Stream) -> spdy_mux::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.is_eof() => {
                info!("Stream {} closed by peer", stream.id());
                break;
            }
            Err(e) => return Err(e),
        };

        info!("Stream {}: received {} bytes", stream.id(), n);

        // Echo back
        stream.write(&buf[..n]).await?;
    }

    Ok(())
}
