//! Logical streams multiplexed over a session
//!
//! Frame format:
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: frame kind (0=data, 1=open, 2=fin, 3=window)
//! - Rest: payload
//!
//! Each direction of a stream starts with [`STREAM_WINDOW`] bytes of send
//! credit. The receiver hands credit back with window frames (big-endian u32
//! payload) as the application consumes data, so a reader that stops reading
//! stalls only its own peer writer and never the session.

use bytes::{BufMut, Bytes, BytesMut};
use futures::task::AtomicWaker;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::trace;

use crate::session::SessionShared;
use crate::WireMessage;

pub(crate) const FRAME_DATA: u8 = 0;
pub(crate) const FRAME_OPEN: u8 = 1;
pub(crate) const FRAME_FIN: u8 = 2;
pub(crate) const FRAME_WINDOW: u8 = 3;

pub(crate) const FRAME_HEADER_LEN: usize = 5;

/// Largest payload carried by a single data frame
pub(crate) const MAX_FRAME_PAYLOAD: usize = 32 * 1024;

/// Bytes a writer may have in flight on one stream before the peer grants more
pub const STREAM_WINDOW: usize = 256 * 1024;

/// Consumed bytes batched up before a window frame goes out
const WINDOW_UPDATE_THRESHOLD: usize = STREAM_WINDOW / 2;

/// Encode a multiplexed frame
pub(crate) fn encode_frame(stream_id: u32, kind: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32(stream_id);
    frame.put_u8(kind);
    frame.extend_from_slice(payload);
    frame.freeze()
}

/// Decode a multiplexed frame header
pub(crate) fn decode_frame_header(data: &[u8]) -> Option<(u32, u8)> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Some((stream_id, data[4]))
}

/// Decode the credit carried by a window frame payload
pub(crate) fn decode_window_update(payload: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = payload.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) as usize)
}

fn session_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

/// Queue a frame without waiting for room in the writer queue
pub(crate) fn send_frame_detached(frame_tx: &mpsc::Sender<WireMessage>, frame: WireMessage) {
    if let Err(mpsc::error::TrySendError::Full(frame)) = frame_tx.try_send(frame) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let frame_tx = frame_tx.clone();
            handle.spawn(async move {
                let _ = frame_tx.send(frame).await;
            });
        }
    }
}

/// Flow-control state of one stream, shared by its handle and the session
/// reader task
#[derive(Debug)]
pub(crate) struct StreamWindow {
    /// Bytes we may still send before the peer grants more
    send_credit: AtomicUsize,
    /// Bytes the peer has sent that we have not granted back yet
    recv_outstanding: AtomicUsize,
    writer: AtomicWaker,
}

impl StreamWindow {
    pub(crate) fn new() -> Self {
        Self {
            send_credit: AtomicUsize::new(STREAM_WINDOW),
            recv_outstanding: AtomicUsize::new(0),
            writer: AtomicWaker::new(),
        }
    }

    /// Credit granted by the peer
    pub(crate) fn grant(&self, credit: usize) {
        self.send_credit.fetch_add(credit, Ordering::AcqRel);
        self.writer.wake();
    }

    /// Account for data received from the peer. Returns false when the peer
    /// sent more than it was allowed to.
    pub(crate) fn receive(&self, len: usize) -> bool {
        let outstanding = self.recv_outstanding.fetch_add(len, Ordering::AcqRel) + len;
        outstanding <= STREAM_WINDOW
    }

    /// Wake a writer parked on credit, used when the session goes away
    pub(crate) fn wake_writer(&self) {
        self.writer.wake();
    }
}

/// One bidirectional byte stream inside a [`Session`](crate::Session).
///
/// Reading returns EOF once the peer half-closes; writing after
/// `shutdown()` fails. Dropping the stream half-closes it toward the peer.
/// When the whole session dies, pending reads fail with
/// `ConnectionAborted` and writes with `BrokenPipe`.
pub struct MuxStream {
    stream_id: u32,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    read_closed: bool,
    window: Arc<StreamWindow>,
    consumed: usize,
    sender: PollSender<WireMessage>,
    write_closed: bool,
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("stream_id", &self.stream_id)
            .field("session", &self.shared.session_id)
            .field("read_closed", &self.read_closed)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: u32,
        rx: mpsc::UnboundedReceiver<Bytes>,
        window: Arc<StreamWindow>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            stream_id,
            rx,
            pending: Bytes::new(),
            read_closed: false,
            window,
            consumed: 0,
            sender: PollSender::new(shared.frame_tx.clone()),
            write_closed: false,
            shared,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Hand consumed bytes back to the peer as send credit
    fn release(&mut self, n: usize) {
        self.consumed += n;
        if self.consumed < WINDOW_UPDATE_THRESHOLD || self.read_closed {
            return;
        }

        let credit = std::mem::take(&mut self.consumed);
        self.window
            .recv_outstanding
            .fetch_sub(credit, Ordering::AcqRel);

        let payload = (credit as u32).to_be_bytes();
        let frame = encode_frame(self.stream_id, FRAME_WINDOW, &payload);
        send_frame_detached(&self.shared.frame_tx, WireMessage::Binary(frame));
        trace!(stream_id = self.stream_id, credit, "Stream granted window");
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                this.release(n);
                return Poll::Ready(Ok(()));
            }

            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                // Empty chunk is the peer's FIN
                Some(data) if data.is_empty() => {
                    trace!(stream_id = this.stream_id, "Stream received FIN");
                    this.read_closed = true;
                }
                Some(data) => this.pending = data,
                None => {
                    this.read_closed = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "session closed",
                    )));
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream write half closed",
            )));
        }
        if this.shared.closed.is_cancelled() {
            return Poll::Ready(Err(session_gone()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // Park until the peer grants credit. Registering before the second
        // check means a grant or close in between still wakes us.
        if this.window.send_credit.load(Ordering::Acquire) == 0 {
            this.window.writer.register(cx.waker());
            if this.shared.closed.is_cancelled() {
                return Poll::Ready(Err(session_gone()));
            }
            if this.window.send_credit.load(Ordering::Acquire) == 0 {
                return Poll::Pending;
            }
        }

        if ready!(this.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(session_gone()));
        }

        // Only this handle spends credit, so it cannot have shrunk meanwhile
        let credit = this.window.send_credit.load(Ordering::Acquire);
        let len = buf.len().min(MAX_FRAME_PAYLOAD).min(credit);
        this.window.send_credit.fetch_sub(len, Ordering::AcqRel);
        let frame = encode_frame(this.stream_id, FRAME_DATA, &buf[..len]);
        this.sender
            .send_item(WireMessage::Binary(frame))
            .map_err(|_| session_gone())?;

        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Ok(()));
        }

        if ready!(this.sender.poll_reserve(cx)).is_err() {
            // Nothing left to half-close
            this.write_closed = true;
            return Poll::Ready(Ok(()));
        }

        let frame = encode_frame(this.stream_id, FRAME_FIN, &[]);
        this.sender
            .send_item(WireMessage::Binary(frame))
            .map_err(|_| session_gone())?;
        this.write_closed = true;
        trace!(stream_id = this.stream_id, "Stream sent FIN");

        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.forget_stream(self.stream_id);

        if self.write_closed || self.shared.closed.is_cancelled() {
            return;
        }

        let frame = WireMessage::Binary(encode_frame(self.stream_id, FRAME_FIN, &[]));
        send_frame_detached(&self.shared.frame_tx, frame);
    }
}
