//! Simple client example
//!
//! Connects to the echo server, sends a message on each of a few streams
//! and prints the responses.
//!
//! Usage: `cargo run --example client [server_addr] [streams]`

use spdy_mux::{dial, Config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,spdy_mux=debug")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let addr = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:7000");
    let count: u32 = match args.get(2) {
        Some(n) => n.parse()?,
        None => 3,
    };

    info!("Connecting to {}", addr);
    let muxer = dial(addr, Config::default()).await?;
    info!("Connected");

    let mut tasks = Vec::new();
    for i in 0..count {
        // Open a stream
        let mut stream = muxer.open()?;
        info!("Opened stream {}", stream.id());

        tasks.push(tokio::spawn(async move {
            let message = format!("Hello from stream {}!", i);
            stream.write_all(message.as_bytes()).await?;

            // Read response
            let mut buf = vec![0u8; message.len()];
            stream.read_exact(&mut buf).await?;
            info!(
                "Stream {} received response: {}",
                stream.id(),
                String::from_utf8_lossy(&buf)
            );

            // Close stream gracefully
            stream.shutdown().await?;
            Ok::<_, std::io::Error>(())
        }));
    }

    for task in tasks {
        task.await??;
    }

    // Close connection
    muxer.close().await;
    info!("Connection closed");

    Ok(())
}
