use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{read_frame, Flag, Frame};
use crate::stream::{CloseReason, Stream, StreamShared};
use crate::transport::Transport;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Which end of the connection a muxer is.
///
/// Decides the parity of locally allocated stream ids so both ends can open
/// streams without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialing side, allocates odd ids (1, 3, 5, ...)
    Client,
    /// Accepting side, allocates even ids (2, 4, 6, ...)
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` belongs to the range this side allocates from.
    fn owns(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }
}

/// How long a closing muxer keeps writing frames queued before the close.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Encoded frame waiting for the writer task.
struct Outbound {
    flag: Flag,
    stream_id: u32,
    len: usize,
    encoded: Bytes,

    /// Told the outcome once the frame is written; `None` for control frames
    done: Option<oneshot::Sender<Result<()>>>,
}

impl Outbound {
    fn complete(self, result: Result<()>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

/// Peer-initiated stream waiting in the accept queue.
///
/// Holds no reference back to the muxer, so queued streams never keep a
/// dead muxer alive.
struct Inbound {
    shared: Arc<StreamShared>,
    rx: mpsc::Receiver<Bytes>,
}

pub(crate) struct MuxerInner {
    role: Role,
    config: Config,

    /// Live streams by id. Never locked across an await.
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,

    /// Frames for the writer task, in wire order; dropped on shutdown
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,

    /// Producer side of the accept queue; dropped on shutdown
    accept_tx: Mutex<Option<mpsc::Sender<Inbound>>>,

    /// Consumer side of the accept queue. The async mutex queues concurrent
    /// `accept()` callers in arrival order.
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,

    /// Next local id; wider than u32 so running out is detectable
    next_local_id: AtomicU64,

    closed: AtomicBool,
    reason: OnceLock<CloseReason>,
    cancel: CancellationToken,

    /// Makes the writer task drop whatever is still queued
    abort: CancellationToken,

    /// Cancelled by the writer task once the write half is shut down
    flushed: CancellationToken,

    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl MuxerInner {
    fn table(&self) -> MutexGuard<'_, HashMap<u32, Arc<StreamShared>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.table().get(&id).cloned()
    }

    /// Take a stream out of the table. Returns it only to the first caller.
    pub(crate) fn remove(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.table().remove(&id)
    }

    /// Register a stream unless the muxer is already shut down.
    fn insert(&self, shared: Arc<StreamShared>) -> Result<()> {
        let mut table = self.table();
        // `shutdown` flips `closed` under this lock, so nothing is inserted
        // after the table has been drained.
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        table.insert(shared.id(), shared);
        Ok(())
    }

    fn allocate_id(&self) -> Result<u32> {
        let id = self.next_local_id.fetch_add(2, Ordering::Relaxed);
        u32::try_from(id).map_err(|_| Error::StreamIdsExhausted)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Error for operations attempted after shutdown.
    pub(crate) fn closed_error(&self) -> Error {
        match self.reason.get() {
            Some(reason) => reason.write_error(0),
            None => Error::ConnectionClosed,
        }
    }

    fn enqueue(&self, frame: Frame, done: Option<oneshot::Sender<Result<()>>>) -> Result<()> {
        let encoded = frame.encode()?;
        let item = Outbound {
            flag: frame.flag,
            stream_id: frame.stream_id,
            len: frame.payload.len(),
            encoded,
            done,
        };

        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(item).map_err(|_| self.closed_error()),
            None => Err(self.closed_error()),
        }
    }

    /// Queue a frame for the connection.
    ///
    /// All outbound frames funnel through one queue and are written whole,
    /// in the order they were queued. The returned receiver resolves once
    /// the frame is written; dropping it does not unqueue the frame. A
    /// write failure is fatal for the whole muxer and is reported to the
    /// frame that hit it.
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<oneshot::Receiver<Result<()>>> {
        let (done, written) = oneshot::channel();
        self.enqueue(frame, Some(done))?;
        Ok(written)
    }

    /// Queue a control frame without waiting for it to be written.
    ///
    /// Never blocks, so it works from the dispatch loop, from `Drop` and
    /// outside a runtime.
    pub(crate) fn queue_frame(&self, frame: Frame) -> Result<()> {
        self.enqueue(frame, None)
    }

    /// Stop the muxer: no new streams, no more frames, every live stream
    /// closed with `reason`. Runs once.
    fn shutdown(&self, reason: CloseReason) {
        let streams: Vec<_> = {
            let mut table = self.table();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let _ = self.reason.set(reason.clone());
            table.drain().map(|(_, stream)| stream).collect()
        };

        self.cancel.cancel();
        self.accept_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // The writer task drains what is already queued after a local
        // close. A broken connection is not worth writing to.
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if !matches!(reason, CloseReason::ConnectionClosed) {
            self.abort.cancel();
        }

        for stream in &streams {
            stream.terminate(reason.clone());
        }

        debug!(
            "Muxer shut down ({}), {} streams force-closed",
            reason,
            streams.len()
        );
    }

    fn dispatch(&self, frame: Frame) {
        trace!(
            "Received {:?} stream={} len={}",
            frame.flag,
            frame.stream_id,
            frame.payload.len()
        );

        match frame.flag {
            Flag::Syn => self.handle_syn(frame.stream_id, frame.payload),
            Flag::Data => match self.lookup(frame.stream_id) {
                Some(stream) => {
                    self.deliver(&stream, frame.payload);
                }
                None => trace!("DATA for unknown stream {}, dropping", frame.stream_id),
            },
            Flag::Fin => match self.remove(frame.stream_id) {
                Some(stream) => {
                    if stream.terminate(CloseReason::PeerFin) {
                        debug!("Stream {} closed by peer", frame.stream_id);
                    }
                }
                None => trace!("FIN for unknown stream {}, dropping", frame.stream_id),
            },
            Flag::WindowUpdate => {
                if let (Some(stream), Some(credit)) =
                    (self.lookup(frame.stream_id), frame.credit())
                {
                    stream.grant(credit);
                }
            }
        }
    }

    fn handle_syn(&self, id: u32, payload: Bytes) {
        if let Some(stream) = self.lookup(id) {
            debug!("Duplicate SYN for stream {}, treating as data", id);
            self.deliver(&stream, payload);
            return;
        }

        if self.role.owns(id) {
            warn!("Ignoring SYN for stream {} from our own id range", id);
            return;
        }

        let (shared, rx) = StreamShared::new(id, &self.config);
        if self.insert(shared.clone()).is_err() {
            return;
        }
        if !payload.is_empty() && !self.deliver(&shared, payload) {
            return;
        }

        let queued = {
            let tx = self.accept_tx.lock().unwrap_or_else(PoisonError::into_inner);
            match tx.as_ref() {
                Some(tx) => tx.try_send(Inbound { shared, rx }),
                None => Err(TrySendError::Closed(Inbound { shared, rx })),
            }
        };

        match queued {
            Ok(()) => debug!("Accepted inbound stream {}", id),
            Err(TrySendError::Full(inbound)) => {
                warn!("Accept backlog full, refusing stream {}", id);
                self.remove(id);
                if inbound.shared.terminate(CloseReason::Refused) {
                    if let Err(e) = self.queue_frame(Frame::fin(id)) {
                        trace!("Refusal of stream {} not sent: {}", id, e);
                    }
                }
            }
            Err(TrySendError::Closed(inbound)) => {
                self.remove(id);
                inbound.shared.terminate(CloseReason::ConnectionClosed);
            }
        }
    }

    /// Hand a payload to a stream. A payload the buffer cannot hold means
    /// the peer ignored its credit; only that stream is torn down.
    ///
    /// Returns whether the stream is still usable.
    fn deliver(&self, stream: &StreamShared, payload: Bytes) -> bool {
        let len = payload.len();
        let window = stream.recv_room();

        if len <= window {
            if stream.receive(payload) == len {
                return true;
            }
            trace!("Stream {} closed, dropped {} bytes", stream.id(), len);
            return false;
        }
        if !stream.is_open() {
            return false;
        }

        warn!(
            "Stream {}: peer sent {} bytes with {} bytes of window left, resetting",
            stream.id(),
            len,
            window
        );
        self.remove(stream.id());
        if stream.begin_close(CloseReason::FlowControl { len, window }) {
            stream.reset(self);
        }
        false
    }
}

/// Owns the read half: decodes frames in wire order and routes them until
/// the connection ends or the muxer is closed.
async fn dispatch_loop<R>(inner: Arc<MuxerInner>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);

    let reason = loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => break CloseReason::ConnectionClosed,
            next = read_frame(&mut reader) => next,
        };

        match next {
            Ok(Some(frame)) => inner.dispatch(frame),
            Ok(None) => {
                debug!("Connection closed by peer");
                let e = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                break CloseReason::Transport(Arc::new(e));
            }
            Err(Error::MalformedFrame(msg)) => {
                warn!("Malformed frame, closing connection: {}", msg);
                break CloseReason::Malformed(msg);
            }
            Err(Error::Io(e)) => {
                debug!("Connection read failed: {}", e);
                break CloseReason::Transport(Arc::new(e));
            }
            Err(e) => {
                let e = io::Error::new(io::ErrorKind::Other, e.to_string());
                break CloseReason::Transport(Arc::new(e));
            }
        }
    };

    inner.shutdown(reason);
}

/// Owns the write half: writes queued frames one at a time until the queue
/// closes, then shuts the write half down.
///
/// After a local close, frames queued before it still go out, for at most
/// `FLUSH_TIMEOUT`. After a connection failure they are dropped.
async fn writer_task<W>(
    inner: Arc<MuxerInner>,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    let drain = async {
        while let Some(item) = queue.recv().await {
            let result = async {
                writer.write_all(&item.encoded).await?;
                writer.flush().await
            }
            .await;

            match result {
                Ok(()) => {
                    trace!(
                        "Sent {:?} stream={} len={}",
                        item.flag,
                        item.stream_id,
                        item.len
                    );
                    item.complete(Ok(()));
                }
                Err(e) => {
                    let e = Arc::new(e);
                    warn!("Write to connection failed: {}", e);
                    inner.shutdown(CloseReason::Transport(e.clone()));
                    item.complete(Err(Error::Transport(e)));
                    return;
                }
            }
        }
    };
    let grace = async {
        inner.cancel.cancelled().await;
        tokio::time::sleep(FLUSH_TIMEOUT).await;
    };

    tokio::select! {
        _ = drain => {}
        _ = inner.abort.cancelled() => debug!("Connection failed, unsent frames dropped"),
        _ = grace => debug!("Peer stopped reading, unsent frames dropped"),
    }

    if let Err(e) = writer.shutdown().await {
        trace!("Connection shutdown: {}", e);
    }
    inner.flushed.cancel();
}

/// Multiplexes many [`Stream`]s over one reliable connection.
///
/// Creating a muxer spawns its dispatch and writer tasks, so it must happen
/// inside a Tokio runtime. Dropping the muxer closes the connection and
/// every stream on it.
pub struct Muxer {
    inner: Arc<MuxerInner>,
}

impl Muxer {
    /// Start multiplexing over `io`.
    pub fn new<T: Transport>(io: T, role: Role, config: Config) -> Result<Self> {
        config.validate()?;

        let local_addr = io.local_addr();
        let peer_addr = io.peer_addr();
        let (reader, writer) = tokio::io::split(io);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(MuxerInner {
            role,
            next_local_id: AtomicU64::new(u64::from(role.first_id())),
            config,
            streams: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Some(outbound_tx)),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed: AtomicBool::new(false),
            reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            abort: CancellationToken::new(),
            flushed: CancellationToken::new(),
            local_addr,
            peer_addr,
        });

        tokio::spawn(dispatch_loop(inner.clone(), reader));
        tokio::spawn(writer_task(inner.clone(), writer, outbound_rx));
        debug!("Muxer started as {:?} (peer {:?})", role, peer_addr);

        Ok(Self { inner })
    }

    /// Muxer for the dialing side (odd stream ids)
    pub fn client<T: Transport>(io: T, config: Config) -> Result<Self> {
        Self::new(io, Role::Client, config)
    }

    /// Muxer for the accepting side (even stream ids)
    pub fn server<T: Transport>(io: T, config: Config) -> Result<Self> {
        Self::new(io, Role::Server, config)
    }

    /// Open a new outbound stream.
    ///
    /// Nothing is sent until the first write; the peer learns about the
    /// stream from its SYN.
    pub fn open(&self) -> Result<Stream> {
        let id = self.inner.allocate_id()?;
        let (shared, rx) = StreamShared::new(id, &self.inner.config);
        self.inner.insert(shared.clone())?;

        debug!("Opening stream id={}", id);
        Ok(Stream::new(shared, rx, self.inner.clone()))
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// Streams that were queued before the muxer shut down are still
    /// handed out, so data and FINs that arrived ahead of a close are not
    /// lost. Once the queue is empty, returns the error that closed the
    /// muxer.
    pub async fn accept(&self) -> Result<Stream> {
        let mut queue = self.inner.accept_rx.lock().await;
        // Shutdown drops the producer, so `recv` ends once the queue drains
        let inbound = queue
            .recv()
            .await
            .ok_or_else(|| self.inner.closed_error())?;

        Ok(Stream::new(inbound.shared, inbound.rx, self.inner.clone()))
    }

    /// Like [`accept`](Self::accept), giving up with [`Error::Timeout`].
    pub async fn accept_timeout(&self, timeout: Duration) -> Result<Stream> {
        tokio::time::timeout(timeout, self.accept())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Close the connection and every stream on it. Safe to call repeatedly.
    ///
    /// Frames queued before the call, such as a FIN from a stream closed
    /// just before, are written first. Returns once the write half is shut
    /// down, which takes at most a few seconds against a peer that stopped
    /// reading.
    pub async fn close(&self) {
        self.inner.shutdown(CloseReason::ConnectionClosed);
        self.inner.flushed.cancelled().await;
    }

    /// Check if the connection is still usable
    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Number of live streams, including ones not yet accepted
    pub fn stream_count(&self) -> usize {
        self.inner.table().len()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<MuxerInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("role", &self.inner.role)
            .field("peer_addr", &self.inner.peer_addr)
            .field("alive", &self.inner.is_alive())
            .finish()
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.inner.shutdown(CloseReason::ConnectionClosed);
    }
}
