// Integration tests over in-memory pipes and real loopback TCP

use bytes::Bytes;
use spdy_mux::protocol::{read_frame, write_frame};
use spdy_mux::{dial, Config, Error, Flag, Frame, MuxListener, Muxer, Stream, MAX_PAYLOAD_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,spdy_mux=debug")
        .try_init();
}

/// Client and server muxers joined by an in-memory pipe.
fn muxer_pair(config: Config) -> (Muxer, Muxer) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let client = Muxer::client(a, config.clone()).unwrap();
    let server = Muxer::server(b, config).unwrap();
    (client, server)
}

/// Client muxer with the raw other end of the pipe.
fn raw_peer(config: Config) -> (Muxer, DuplexStream) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (Muxer::client(a, config).unwrap(), b)
}

async fn accept(muxer: &Muxer) -> Stream {
    muxer
        .accept_timeout(TIMEOUT)
        .await
        .expect("Timeout accepting stream")
}

async fn next_frame(raw: &mut DuplexStream) -> Option<Frame> {
    timeout(TIMEOUT, read_frame(raw))
        .await
        .expect("Timeout reading frame")
        .unwrap()
}

/// Read until end of stream, returning everything received.
async fn read_to_end(stream: &mut Stream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 7 * 1024];
    loop {
        match timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .expect("Timeout reading stream")
        {
            Ok(n) => {
                assert!(n > 0, "read returned 0 for a non-empty buffer");
                out.extend_from_slice(&buf[..n]);
            }
            Err(Error::EndOfStream) => return out,
            Err(e) => panic!("Unexpected read error: {}", e),
        }
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// write "hello", close with FIN: the peer reads "hello" then end of stream.
#[tokio::test]
async fn test_hello_then_fin() {
    init_tracing();
    let (client, server) = muxer_pair(Config::default());

    let stream = client.open().unwrap();
    stream.write(b"hello").await.unwrap();
    stream.close(true).await.unwrap();

    let mut peer = accept(&server).await;
    let mut buf = [0u8; 64];
    let n = peer.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");

    let end = timeout(TIMEOUT, peer.read(&mut buf)).await.unwrap();
    assert!(matches!(end, Err(Error::EndOfStream)));

    // Writing back after the peer's FIN is refused
    assert!(matches!(peer.write(b"late").await, Err(Error::StreamClosed)));
    assert!(matches!(peer.close(true).await, Err(Error::AlreadyClosed)));
}

/// "AAAA" on one stream and "BBBB" on another land on their own ids.
#[tokio::test]
async fn test_two_streams_on_the_wire() {
    init_tracing();
    let (client, mut raw) = raw_peer(Config::default());

    let a = client.open().unwrap();
    let b = client.open().unwrap();
    a.write(b"AAAA").await.unwrap();
    b.write(b"BBBB").await.unwrap();

    let first = next_frame(&mut raw).await.unwrap();
    let second = next_frame(&mut raw).await.unwrap();

    assert_eq!(first, Frame::syn(a.id(), Bytes::from_static(b"AAAA")));
    assert_eq!(second, Frame::syn(b.id(), Bytes::from_static(b"BBBB")));
}

#[tokio::test]
async fn test_large_write_is_split_into_frames() {
    init_tracing();
    let (client, mut raw) = raw_peer(Config::default());
    let data = pattern(200_000, 7);

    let stream = Arc::new(client.open().unwrap());
    let id = stream.id();
    let writer = tokio::spawn({
        let stream = stream.clone();
        let data = data.clone();
        async move { stream.write(&data).await }
    });

    let mut received = Vec::new();
    let mut frames = 0;
    while received.len() < data.len() {
        let frame = next_frame(&mut raw).await.unwrap();
        assert_eq!(frame.stream_id, id);
        assert_eq!(frame.flag, if frames == 0 { Flag::Syn } else { Flag::Data });
        assert!(frame.payload.len() <= MAX_PAYLOAD_SIZE);
        received.extend_from_slice(&frame.payload);
        frames += 1;
    }

    assert!(frames >= 4);
    assert_eq!(received, data);
    assert_eq!(writer.await.unwrap().unwrap(), data.len());
}

/// Reassembly holds for any chunking of writes and reads.
#[tokio::test]
async fn test_reassembly_various_chunk_sizes() {
    init_tracing();
    // Small window so credit is exercised as well
    let (client, server) = muxer_pair(Config::default().with_window_size(10_000));

    for (seed, chunk) in [1usize, 13, 1000, 65_535, 70_000].into_iter().enumerate() {
        let data = pattern(150_000, seed as u8);
        let stream = client.open().unwrap();

        let writer = tokio::spawn({
            let data = data.clone();
            async move {
                for piece in data.chunks(chunk) {
                    stream.write(piece).await.unwrap();
                }
                stream.close(true).await.unwrap();
            }
        });

        let mut peer = accept(&server).await;
        let received = read_to_end(&mut peer).await;
        writer.await.unwrap();

        assert_eq!(received.len(), data.len(), "chunk size {}", chunk);
        assert_eq!(received, data, "chunk size {}", chunk);
    }
}

/// Interleaved writers on two streams never mix their bytes.
#[tokio::test]
async fn test_stream_isolation() {
    init_tracing();
    let (client, server) = muxer_pair(Config::default());

    let a = client.open().unwrap();
    let b = client.open().unwrap();

    let write_a = tokio::spawn(async move {
        for _ in 0..200 {
            a.write(&[b'A'; 1500]).await.unwrap();
        }
        a.close(true).await.unwrap();
    });
    let write_b = tokio::spawn(async move {
        for _ in 0..200 {
            b.write(&[b'B'; 900]).await.unwrap();
        }
        b.close(true).await.unwrap();
    });

    let mut first = accept(&server).await;
    let mut second = accept(&server).await;
    let (first_data, second_data) =
        tokio::join!(read_to_end(&mut first), read_to_end(&mut second));
    write_a.await.unwrap();
    write_b.await.unwrap();

    for (stream, data) in [(&first, first_data), (&second, second_data)] {
        let (byte, len) = if stream.id() == 1 { (b'A', 1500) } else { (b'B', 900) };
        assert_eq!(data.len(), 200 * len);
        assert!(data.iter().all(|&c| c == byte), "stream {} mixed", stream.id());
    }
}

/// Concurrent writers on one stream are serialized whole.
#[tokio::test]
async fn test_concurrent_writes_do_not_interleave() {
    init_tracing();
    let (client, server) = muxer_pair(Config::default());
    let stream = Arc::new(client.open().unwrap());

    // Three writes exceed the window, so the reader has to keep up
    let reader = tokio::spawn(async move {
        let mut peer = accept(&server).await;
        read_to_end(&mut peer).await
    });

    let mut writers = Vec::new();
    for byte in [b'x', b'y', b'z'] {
        let stream = stream.clone();
        writers.push(tokio::spawn(async move {
            stream.write(&vec![byte; 150_000]).await.unwrap();
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    stream.close(true).await.unwrap();

    let data = reader.await.unwrap();
    assert_eq!(data.len(), 450_000);
    for run in data.chunks(150_000) {
        assert!(run.iter().all(|&c| c == run[0]));
    }
}

/// Two concurrent closes produce exactly one FIN and both return.
#[tokio::test]
async fn test_concurrent_close_single_fin() {
    init_tracing();
    let (client, mut raw) = raw_peer(Config::default());

    let stream = Arc::new(client.open().unwrap());
    stream.write(b"data").await.unwrap();

    let (r1, r2) = tokio::join!(stream.close(true), stream.close(true));
    let results = [r1, r2];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(Error::AlreadyClosed)))
            .count(),
        1
    );

    assert_eq!(next_frame(&mut raw).await.unwrap().flag, Flag::Syn);
    assert_eq!(next_frame(&mut raw).await.unwrap(), Frame::fin(stream.id()));

    // Nothing after the single FIN
    let more = timeout(Duration::from_millis(200), read_frame(&mut raw)).await;
    assert!(more.is_err());
}

/// A stream that never wrote closes without any wire traffic.
#[tokio::test]
async fn test_concurrent_close_unannounced_stream() {
    init_tracing();
    let (client, mut raw) = raw_peer(Config::default());

    let stream = Arc::new(client.open().unwrap());
    let (r1, r2) = tokio::join!(stream.close(true), stream.close(true));
    assert!(r1.is_ok() ^ r2.is_ok());

    let nothing = timeout(Duration::from_millis(200), read_frame(&mut raw)).await;
    assert!(nothing.is_err());
}

/// Dropping a handle closes the stream and queues a FIN.
#[tokio::test]
async fn test_drop_sends_fin() {
    init_tracing();
    let (client, server) = muxer_pair(Config::default());

    let stream = client.open().unwrap();
    stream.write(b"bye").await.unwrap();
    drop(stream);

    let mut peer = accept(&server).await;
    assert_eq!(read_to_end(&mut peer).await, b"bye");
    assert_eq!(client.stream_count(), 0);
}

/// Severing the connection unblocks a pending read and a write waiting on
/// credit, both with a transport error.
#[tokio::test]
async fn test_severed_connection_unblocks_streams() {
    init_tracing();
    let (client, mut raw) = raw_peer(Config::default().with_window_size(16));

    let mut reader = client.open().unwrap();
    let writer = Arc::new(client.open().unwrap());

    // Exhaust the writer's credit so its next write parks
    writer.write(&[0u8; 16]).await.unwrap();
    next_frame(&mut raw).await.unwrap();
    let blocked_write = tokio::spawn({
        let writer = writer.clone();
        async move { writer.write(b"more").await }
    });
    let blocked_read = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read(&mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(raw);

    let write_result = timeout(TIMEOUT, blocked_write)
        .await
        .expect("Write did not unblock")
        .unwrap();
    let read_result = timeout(TIMEOUT, blocked_read)
        .await
        .expect("Read did not unblock")
        .unwrap();

    assert!(matches!(write_result, Err(Error::Transport(_))));
    assert!(matches!(read_result, Err(Error::Transport(_))));
    assert!(!client.is_alive());
    assert_eq!(client.stream_count(), 0);
}

/// Closing the muxer ends everything with a connection error and the peer
/// sees its streams fail.
#[tokio::test]
async fn test_muxer_close_propagates() {
    init_tracing();
    let (client, server) = muxer_pair(Config::default());

    let stream = client.open().unwrap();
    stream.write(b"ping").await.unwrap();
    let mut peer = accept(&server).await;

    client.close().await;
    assert!(matches!(stream.write(b"x").await, Err(Error::ConnectionClosed)));

    let mut buf = [0u8; 8];
    let n = peer.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
    let err = timeout(TIMEOUT, peer.read(&mut buf)).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    let accept_err = server.accept_timeout(TIMEOUT).await.unwrap_err();
    assert!(matches!(accept_err, Error::Transport(_)));
}

/// A stream that arrived before the peer hung up can still be accepted,
/// with its data and its FIN.
#[tokio::test]
async fn test_accept_after_peer_close_drains_queue() {
    init_tracing();
    let (client, server) = muxer_pair(Config::default());

    let stream = client.open().unwrap();
    stream.write(b"hello").await.unwrap();
    stream.close(true).await.unwrap();
    client.close().await;

    // Only accept once the server has seen the hangup
    timeout(TIMEOUT, async {
        while server.is_alive() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for the server to notice the hangup");

    let mut peer = accept(&server).await;
    assert_eq!(read_to_end(&mut peer).await, b"hello");

    let accept_err = server.accept_timeout(TIMEOUT).await.unwrap_err();
    assert!(matches!(accept_err, Error::Transport(_)));
}

/// A stream nobody reads does not hold up another stream.
#[tokio::test]
async fn test_slow_reader_does_not_stall_others() {
    init_tracing();
    let config = Config::default().with_window_size(32 * 1024);
    let (client, server) = muxer_pair(config);

    // Stuck stream: its reader never runs, so its writer runs out of credit
    let stuck = Arc::new(client.open().unwrap());
    let stuck_writer = tokio::spawn({
        let stuck = stuck.clone();
        async move { stuck.write(&vec![1u8; 200_000]).await }
    });
    let _stuck_peer = accept(&server).await;

    // Meanwhile another stream moves far more than a window
    let fast = client.open().unwrap();
    let data = pattern(500_000, 3);
    let fast_writer = tokio::spawn({
        let data = data.clone();
        async move {
            fast.write(&data).await.unwrap();
            fast.close(true).await.unwrap();
        }
    });

    let mut fast_peer = accept(&server).await;
    assert_eq!(read_to_end(&mut fast_peer).await, data);
    fast_writer.await.unwrap();

    assert!(!stuck_writer.is_finished());
    stuck_writer.abort();
}

#[tokio::test]
async fn test_accept_backlog_refusal() {
    init_tracing();
    let config = Config::default().with_accept_backlog(1);
    let (client, server) = muxer_pair(config);

    let first = client.open().unwrap();
    first.write(b"one").await.unwrap();

    // Let the first SYN land in the queue before the second arrives
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = client.open().unwrap();
    second.write(b"two").await.unwrap();

    // The refusal FIN ends the second stream on the client side
    let mut buf = [0u8; 8];
    let end = timeout(TIMEOUT, second.read(&mut buf)).await.unwrap();
    assert!(matches!(end, Err(Error::EndOfStream)));

    let mut accepted = accept(&server).await;
    assert_eq!(accepted.id(), first.id());
    let n = accepted.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"one");
}

/// Both ends open streams at once without id collisions.
#[tokio::test]
async fn test_bidirectional_open() {
    init_tracing();
    let (client, server) = muxer_pair(Config::default());

    let from_client = client.open().unwrap();
    let from_server = server.open().unwrap();
    from_client.write(b"c2s").await.unwrap();
    from_server.write(b"s2c").await.unwrap();

    let mut at_server = accept(&server).await;
    let mut at_client = accept(&client).await;
    assert_eq!(at_server.id(), from_client.id());
    assert_eq!(at_client.id(), from_server.id());
    assert_ne!(from_client.id(), from_server.id());

    let mut buf = [0u8; 8];
    let n = at_server.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"c2s");
    let n = at_client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"s2c");

    // Replies flow back on the same streams
    at_server.write(b"ack").await.unwrap();
    let mut from_client = from_client;
    let n = from_client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ack");
}

#[tokio::test]
async fn test_accept_timeout() {
    init_tracing();
    let (_client, server) = muxer_pair(Config::default());

    let result = server.accept_timeout(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(server.is_alive());
}

/// Raw peer: the muxer returns credit as the application reads.
#[tokio::test]
async fn test_window_update_sent_after_reads() {
    init_tracing();
    let (client, mut raw) = raw_peer(Config::default().with_window_size(100));

    write_frame(&mut raw, &Frame::syn(2, Bytes::from(vec![9u8; 60])))
        .await
        .unwrap();
    let mut stream = accept(&client).await;

    let mut buf = [0u8; 100];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 60);

    let update = next_frame(&mut raw).await.unwrap();
    assert_eq!(update.flag, Flag::WindowUpdate);
    assert_eq!(update.stream_id, 2);
    assert_eq!(update.credit(), Some(60));
}

/// The stream works as a plain tokio I/O object.
#[tokio::test]
async fn test_async_read_write_traits() {
    init_tracing();
    let (client, server) = muxer_pair(Config::default());

    let echo = tokio::spawn(async move {
        let mut peer = accept(&server).await;
        let mut buf = [0u8; 18];
        peer.read_exact(&mut buf).await.unwrap();
        peer.write_all(&buf).await.unwrap();

        // The client's shutdown shows up as EOF
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        server
    });

    let mut stream = client.open().unwrap();
    stream.write_all(b"through the traits").await.unwrap();
    stream.flush().await.unwrap();

    let mut back = [0u8; 18];
    stream.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"through the traits");

    stream.shutdown().await.unwrap();
    let _server = timeout(TIMEOUT, echo).await.unwrap().unwrap();
    assert!(stream.is_closed());
}

#[tokio::test]
async fn test_tcp_concurrent_clients() {
    init_tracing();
    let listener = MuxListener::bind("127.0.0.1:0", Config::default())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        for _ in 0..3 {
            let (muxer, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                while let Ok(mut stream) = muxer.accept().await {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        while let Ok(n) = stream.read(&mut buf).await {
                            if stream.write(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            });
        }
    });

    let mut clients = Vec::new();
    for c in 0..3u8 {
        clients.push(tokio::spawn(async move {
            let muxer = dial(addr, Config::default()).await.unwrap();
            for s in 0..3u8 {
                let mut stream = muxer.open().unwrap();
                for round in 0..3u8 {
                    let msg = [c, s, round];
                    stream.write(&msg).await.unwrap();
                    let mut buf = [0u8; 3];
                    let mut got = 0;
                    while got < 3 {
                        got += timeout(TIMEOUT, stream.read(&mut buf[got..]))
                            .await
                            .expect("Timeout waiting for echo")
                            .unwrap();
                    }
                    assert_eq!(buf, msg);
                }
                stream.close(true).await.unwrap();
            }
            muxer.close().await;
        }));
    }

    for client in clients {
        client.await.unwrap();
    }
    server.await.unwrap();
}
