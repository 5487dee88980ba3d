use crate::config::Config;
use crate::error::{Error, Result};
use crate::muxer::MuxerInner;
use crate::protocol::{Frame, MAX_PAYLOAD_SIZE};
use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::{CancellationToken, ReusableBoxFuture};
use tracing::{debug, trace, warn};

const PHASE_OPEN: u8 = 0;
const PHASE_CLOSING: u8 = 1;
const PHASE_CLOSED: u8 = 2;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Registered locally, nothing sent yet; invisible to the peer
    Idle,
    /// SYN sent or received, can send/receive
    Open,
    /// Local close in progress (FIN not yet written)
    Closing,
    /// Terminal
    Closed,
}

/// Why a stream stopped. Recorded once by whoever won the close.
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    /// `close()` or drop on this side
    Local,
    /// FIN received
    PeerFin,
    /// Accept backlog was full when the SYN arrived
    Refused,
    /// Peer wrote past its credit
    FlowControl { len: usize, window: usize },
    /// Muxer closed locally
    ConnectionClosed,
    /// Physical connection failed
    Transport(Arc<io::Error>),
    /// Undecodable frame on the connection
    Malformed(String),
}

impl CloseReason {
    /// Error surfaced to a writer.
    pub(crate) fn write_error(&self, id: u32) -> Error {
        match self {
            CloseReason::Local | CloseReason::PeerFin | CloseReason::Refused => {
                Error::StreamClosed
            }
            other => other.connection_error(id),
        }
    }

    /// Error surfaced to a reader once the buffer is drained.
    pub(crate) fn read_error(&self, id: u32) -> Error {
        match self {
            CloseReason::PeerFin => Error::EndOfStream,
            other => other.write_error(id),
        }
    }

    fn connection_error(&self, id: u32) -> Error {
        match self {
            CloseReason::FlowControl { len, window } => Error::FlowControl {
                id,
                len: *len,
                window: *window,
            },
            CloseReason::Transport(e) => Error::Transport(e.clone()),
            CloseReason::Malformed(msg) => Error::MalformedFrame(msg.clone()),
            _ => Error::ConnectionClosed,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::PeerFin => write!(f, "FIN from peer"),
            CloseReason::Refused => write!(f, "refused"),
            CloseReason::FlowControl { len, window } => {
                write!(f, "flow control violation ({} > {})", len, window)
            }
            CloseReason::ConnectionClosed => write!(f, "connection closed"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Malformed(msg) => write!(f, "malformed frame: {}", msg),
        }
    }
}

/// Per-stream write state, guarded by the stream's write lock.
#[derive(Debug, Default)]
struct WriteState {
    /// SYN has gone out; everything after is DATA
    syn_sent: bool,
}

/// State shared between the muxer's table entry and the caller's handle.
pub(crate) struct StreamShared {
    id: u32,

    /// PHASE_OPEN -> PHASE_CLOSING -> PHASE_CLOSED, advanced by compare-and-set
    phase: AtomicU8,

    /// Set exactly once by the close winner
    reason: OnceLock<CloseReason>,

    /// Fires when the stream starts closing; writers stop waiting on it
    closing: CancellationToken,

    /// Serializes writers so their frames never interleave
    write: tokio::sync::Mutex<WriteState>,

    /// Mirror of `WriteState::syn_sent` for lock-free state queries
    send_opened: AtomicBool,

    /// Send credit in bytes, refilled by WINDOW_UPDATE frames
    credit: Semaphore,

    /// Producer side of the receive buffer; dropped when the stream closes
    recv_tx: Mutex<Option<mpsc::Sender<Bytes>>>,

    /// Receive buffer capacity in bytes
    window: usize,

    /// Bytes sitting in the receive buffer
    buffered: AtomicUsize,

    /// Bytes read but not yet returned to the sender as credit
    unreported: AtomicUsize,

    /// `unreported` level that triggers a WINDOW_UPDATE
    update_threshold: usize,
}

impl StreamShared {
    /// Create the shared half of a stream and the consumer side of its buffer.
    pub(crate) fn new(id: u32, config: &Config) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        // Chunks are never empty, so a channel of `window_size` slots can
        // always hold `window_size` bytes.
        let (tx, rx) = mpsc::channel(config.window_size);

        let shared = Arc::new(Self {
            id,
            phase: AtomicU8::new(PHASE_OPEN),
            reason: OnceLock::new(),
            closing: CancellationToken::new(),
            write: tokio::sync::Mutex::new(WriteState::default()),
            send_opened: AtomicBool::new(false),
            credit: Semaphore::new(config.window_size),
            recv_tx: Mutex::new(Some(tx)),
            window: config.window_size,
            buffered: AtomicUsize::new(0),
            unreported: AtomicUsize::new(0),
            update_threshold: config.window_update_threshold(),
        });

        (shared, rx)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_OPEN
    }

    pub(crate) fn send_opened(&self) -> bool {
        self.send_opened.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> StreamState {
        match self.phase.load(Ordering::Acquire) {
            PHASE_OPEN if self.send_opened() => StreamState::Open,
            PHASE_OPEN => StreamState::Idle,
            PHASE_CLOSING => StreamState::Closing,
            _ => StreamState::Closed,
        }
    }

    fn reason(&self) -> CloseReason {
        // The winner sets the reason right after its compare-and-set.
        self.reason.get().cloned().unwrap_or(CloseReason::Local)
    }

    fn write_error(&self) -> Error {
        self.reason().write_error(self.id)
    }

    fn read_error(&self) -> Error {
        self.reason().read_error(self.id)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.write_error())
        }
    }

    /// Bytes the receive buffer can still take.
    pub(crate) fn recv_room(&self) -> usize {
        self.window
            .saturating_sub(self.buffered.load(Ordering::Acquire))
    }

    /// Append a DATA payload to the receive buffer.
    ///
    /// Called only from the dispatch loop. Never waits: returns how many
    /// bytes were accepted, which is short when the peer overran its credit
    /// and zero once the stream is closed.
    pub(crate) fn receive(&self, payload: Bytes) -> usize {
        if payload.is_empty() {
            return 0;
        }

        let guard = self.recv_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return 0;
        };

        let accepted = payload.len().min(self.recv_room());
        if accepted == 0 {
            return 0;
        }

        self.buffered.fetch_add(accepted, Ordering::AcqRel);
        match tx.try_send(payload.slice(..accepted)) {
            Ok(()) => accepted,
            Err(_) => {
                // Reader is gone; nothing will drain this.
                self.buffered.fetch_sub(accepted, Ordering::AcqRel);
                0
            }
        }
    }

    /// Account for `n` bytes handed to the reader. Returns the credit to
    /// send back once enough has accumulated.
    fn consume(&self, n: usize) -> Option<u32> {
        self.buffered.fetch_sub(n, Ordering::AcqRel);
        let unreported = self.unreported.fetch_add(n, Ordering::AcqRel) + n;
        if unreported < self.update_threshold || !self.is_open() {
            return None;
        }
        let credit = self.unreported.swap(0, Ordering::AcqRel);
        // window_size is validated to fit in u32
        u32::try_from(credit).ok().filter(|c| *c > 0)
    }

    /// Add send credit from a WINDOW_UPDATE.
    pub(crate) fn grant(&self, credit: u32) {
        let credit = credit as usize;
        let available = self.credit.available_permits();
        let room = self.window.saturating_sub(available);
        if credit > room {
            warn!(
                "Stream {}: peer granted {} bytes of credit with only {} outstanding, clamping",
                self.id, credit, room
            );
        }
        let credit = credit.min(room);
        if credit > 0 {
            self.credit.add_permits(credit);
        }
    }

    /// Wait for send credit. Returns between 1 and `want` bytes of it.
    async fn acquire_credit(&self, want: usize) -> Result<usize> {
        let first = self
            .credit
            .acquire()
            .await
            .map_err(|_| self.write_error())?;
        first.forget();

        let extra = self.credit.available_permits().min(want - 1);
        if extra > 0 {
            if let Ok(permits) = self.credit.try_acquire_many(extra as u32) {
                permits.forget();
                return Ok(1 + extra);
            }
        }
        Ok(1)
    }

    /// Claim the teardown. Only the first caller gets `true`.
    ///
    /// The winner records `reason`, wakes writers waiting for credit or for
    /// their frame to be written, and closes the receive buffer so readers
    /// see the end once it drains.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        if self
            .phase
            .compare_exchange(
                PHASE_OPEN,
                PHASE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let _ = self.reason.set(reason);
        self.closing.cancel();
        self.credit.close();
        self.recv_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    /// Queue a FIN if requested and the peer has seen this stream, then
    /// mark it closed.
    ///
    /// Waits only for the write lock, which writers drop as soon as
    /// `closing` fires, so the FIN is queued behind every frame they
    /// already queued. It does not wait for the FIN to reach the wire.
    pub(crate) async fn finish_close(&self, muxer: &MuxerInner, send_fin: bool) -> Result<()> {
        let state = self.write.lock().await;
        let result = if send_fin && state.syn_sent {
            muxer.queue_frame(Frame::fin(self.id))
        } else {
            Ok(())
        };
        self.phase.store(PHASE_CLOSED, Ordering::Release);
        drop(state);

        if let Err(e) = &result {
            debug!("Stream {}: FIN not delivered: {}", self.id, e);
        }
        result
    }

    /// Like `finish_close`, but the FIN goes out even if the peer never
    /// saw a SYN from this side, so its writer stops too.
    pub(crate) fn reset(&self, muxer: &MuxerInner) {
        if let Err(e) = muxer.queue_frame(Frame::fin(self.id)) {
            debug!("Stream {}: reset not delivered: {}", self.id, e);
        }
        self.phase.store(PHASE_CLOSED, Ordering::Release);
    }

    /// Close without sending anything. Used by the dispatch loop and muxer
    /// shutdown.
    pub(crate) fn terminate(&self, reason: CloseReason) -> bool {
        if !self.begin_close(reason) {
            return false;
        }
        self.phase.store(PHASE_CLOSED, Ordering::Release);
        true
    }

    pub(crate) fn mark_closed(&self) {
        self.phase.store(PHASE_CLOSED, Ordering::Release);
    }
}

/// Write `data` as SYN/DATA frames, waiting for credit as needed.
async fn send_data(shared: &StreamShared, muxer: &MuxerInner, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }

    let mut state = shared.write.lock().await;
    let mut rest = data;

    while !rest.is_empty() {
        shared.ensure_writable()?;
        let n = tokio::select! {
            biased;
            _ = shared.closing.cancelled() => return Err(shared.write_error()),
            n = shared.acquire_credit(rest.len().min(MAX_PAYLOAD_SIZE)) => n?,
        };
        shared.ensure_writable()?;

        let payload = Bytes::copy_from_slice(&rest[..n]);
        let frame = if state.syn_sent {
            Frame::data(shared.id, payload)
        } else {
            Frame::syn(shared.id, payload)
        };
        let written = muxer.send_frame(frame)?;

        if !state.syn_sent {
            state.syn_sent = true;
            shared.send_opened.store(true, Ordering::Release);
            debug!("Stream {} announced to peer", shared.id);
        }

        // The frame stays queued and goes out whole even if we stop waiting
        tokio::select! {
            biased;
            _ = shared.closing.cancelled() => return Err(shared.write_error()),
            res = written => res.unwrap_or_else(|_| Err(muxer.closed_error()))?,
        }
        trace!("Stream {}: sent {} bytes", shared.id, n);
        rest = &rest[n..];
    }

    Ok(data.len())
}

/// Local close, shared by `Stream::close` and `poll_shutdown`.
async fn close_stream(shared: &StreamShared, muxer: &MuxerInner, send_fin: bool) -> Result<()> {
    if !shared.begin_close(CloseReason::Local) {
        return Err(Error::AlreadyClosed);
    }
    muxer.remove(shared.id);
    debug!("Closing stream {} (fin={})", shared.id, send_fin);
    shared.finish_close(muxer, send_fin).await
}

/// A logical byte stream multiplexed over a [`Muxer`](crate::Muxer).
///
/// Implements `AsyncRead + AsyncWrite`, so it can stand in for a socket. The
/// first write opens the stream on the peer; a stream that is never written
/// to stays invisible to it. Dropping a handle that was not closed closes it
/// and queues a FIN.
///
/// There is no half-close. A FIN from the peer ends the stream in both
/// directions: data already buffered can still be read, after which reads
/// return [`Error::EndOfStream`], and writes fail with
/// [`Error::StreamClosed`] right away. In the same way a local
/// [`close`](Self::close) stops reads as well as writes: buffered data
/// drains, then reads return [`Error::StreamClosed`]. Protocols that need
/// to finish sending and still read a reply must signal the end of a
/// request in-band.
pub struct Stream {
    shared: Arc<StreamShared>,
    muxer: Arc<MuxerInner>,

    /// Consumer side of the receive buffer
    rx: mpsc::Receiver<Bytes>,

    /// Partially read chunk
    pending: Bytes,

    /// In-flight `poll_write`
    write_fut: Option<ReusableBoxFuture<'static, Result<usize>>>,

    /// In-flight `poll_shutdown`
    close_fut: Option<ReusableBoxFuture<'static, Result<()>>>,
}

impl Stream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        rx: mpsc::Receiver<Bytes>,
        muxer: Arc<MuxerInner>,
    ) -> Self {
        Self {
            shared,
            muxer,
            rx,
            pending: Bytes::new(),
            write_fut: None,
            close_fut: None,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Get current stream state
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Check if stream is closed from either side
    pub fn is_closed(&self) -> bool {
        !self.shared.is_open()
    }

    /// Local address of the underlying connection, if it has one
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.muxer.local_addr()
    }

    /// Remote address of the underlying connection, if it has one
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.muxer.peer_addr()
    }

    /// Read into `buf`, waiting while the buffer is empty.
    ///
    /// Returns the number of bytes read (non-zero for a non-empty `buf`),
    /// [`Error::EndOfStream`] once the peer's FIN has been reached, or the
    /// error that closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        std::future::poll_fn(|cx| self.poll_read_bytes(cx, buf)).await
    }

    /// Write all of `buf`, split into frames of at most 65535 bytes.
    ///
    /// Concurrent writes on the same stream are serialized, never
    /// interleaved. Waits while the peer's window is full.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        send_data(&self.shared, &self.muxer, buf).await
    }

    /// Close the stream. Only the first call does anything; later calls
    /// return [`Error::AlreadyClosed`].
    ///
    /// With `send_fin`, a FIN is queued if the peer has seen the stream.
    /// A write in progress on another task fails with
    /// [`Error::StreamClosed`] instead of holding the close up, even while
    /// the connection itself is stalled. Local resources are released even
    /// if the FIN cannot be queued.
    pub async fn close(&self, send_fin: bool) -> Result<()> {
        close_stream(&self.shared, &self.muxer, send_fin).await
    }

    fn poll_read_bytes(&mut self, cx: &mut Context<'_>, dst: &mut [u8]) -> Poll<Result<usize>> {
        if dst.is_empty() {
            return Poll::Ready(Ok(0));
        }

        while self.pending.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(chunk) => self.pending = chunk,
                None => return Poll::Ready(Err(self.shared.read_error())),
            }
        }

        let n = dst.len().min(self.pending.len());
        dst[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);

        if let Some(credit) = self.shared.consume(n) {
            trace!("Stream {}: returning {} bytes of credit", self.shared.id, credit);
            if let Err(e) = self
                .muxer
                .queue_frame(Frame::window_update(self.shared.id, credit))
            {
                trace!("Stream {}: credit not returned: {}", self.shared.id, e);
            }
        }

        Poll::Ready(Ok(n))
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let dst = buf.initialize_unfilled();
        match ready!(this.poll_read_bytes(cx, dst)) {
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            // Nothing filled means EOF to AsyncRead callers
            Err(Error::EndOfStream) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_fut.is_none() && buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // A pending write is resumed with the bytes it started with; callers
        // retry with the same buffer, as `write_all` does.
        let fut = this.write_fut.get_or_insert_with(|| {
            let shared = this.shared.clone();
            let muxer = this.muxer.clone();
            let data = Bytes::copy_from_slice(&buf[..buf.len().min(MAX_PAYLOAD_SIZE)]);
            ReusableBoxFuture::new(async move { send_data(&shared, &muxer, &data).await })
        });

        let result = ready!(fut.poll(cx));
        this.write_fut = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed to the connection as they are written
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let fut = this.close_fut.get_or_insert_with(|| {
            let shared = this.shared.clone();
            let muxer = this.muxer.clone();
            ReusableBoxFuture::new(async move { close_stream(&shared, &muxer, true).await })
        });

        let result = ready!(fut.poll(cx));
        this.close_fut = None;
        match result {
            Ok(()) | Err(Error::AlreadyClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.shared.begin_close(CloseReason::Local) {
            return;
        }
        self.muxer.remove(self.shared.id);

        // No other writer can hold this handle, and an in-flight
        // `poll_write` is dropped right after this, so nothing queues
        // behind the FIN.
        if self.shared.send_opened() {
            if let Err(e) = self.muxer.queue_frame(Frame::fin(self.shared.id)) {
                trace!("Stream {} dropped, FIN not queued: {}", self.shared.id, e);
            }
        }
        self.shared.mark_closed();
        debug!("Stream {} dropped", self.shared.id);
    }
}
