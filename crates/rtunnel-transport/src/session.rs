//! Multiplexed session over one WebSocket connection

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rtunnel_proto::{ControlCodec, ControlMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::stream::{
    decode_frame_header, decode_window_update, encode_frame, send_frame_detached, MuxStream,
    StreamWindow, FRAME_DATA, FRAME_FIN, FRAME_HEADER_LEN, FRAME_OPEN, FRAME_WINDOW,
};
use crate::{TransportError, TransportResult, WireMessage, WireSink, WireSocket, WireSource};

/// Grace period for flushing queued frames once the session is closing
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Which end of the WebSocket this session sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the WebSocket; opens the control stream, uses odd stream ids
    Initiator,
    /// Accepted the WebSocket; accepts the control stream, uses even stream ids
    Acceptor,
}

/// Session statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_streams: usize,
    pub uptime_secs: u64,
}

/// Reader-side handle on one live stream
struct StreamEntry {
    /// Unbounded; the peer's send window caps what can pile up here
    tx: mpsc::UnboundedSender<Bytes>,
    window: Arc<StreamWindow>,
}

/// State shared between the session handle, its streams and its tasks
pub(crate) struct SessionShared {
    pub(crate) session_id: String,
    pub(crate) frame_tx: mpsc::Sender<WireMessage>,
    pub(crate) closed: CancellationToken,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    next_stream_id: AtomicU32,
    pong: Notify,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl SessionShared {
    fn streams(&self) -> MutexGuard<'_, HashMap<u32, StreamEntry>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_stream(self: &Arc<Self>, stream_id: u32) -> MuxStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let window = Arc::new(StreamWindow::new());
        self.streams().insert(
            stream_id,
            StreamEntry {
                tx,
                window: window.clone(),
            },
        );
        MuxStream::new(stream_id, rx, window, self.clone())
    }

    pub(crate) fn forget_stream(&self, stream_id: u32) {
        self.streams().remove(&stream_id);
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(session = %self.session_id, "Closing session");
            self.closed.cancel();
            for entry in self.streams().values() {
                entry.window.wake_writer();
            }
        }
    }

    async fn open_stream(self: &Arc<Self>) -> TransportResult<MuxStream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let stream = self.register_stream(stream_id);

        let frame = WireMessage::Binary(encode_frame(stream_id, FRAME_OPEN, &[]));
        if self.frame_tx.send(frame).await.is_err() {
            return Err(TransportError::SessionClosed);
        }

        trace!(session = %self.session_id, stream_id, "Opened stream");
        Ok(stream)
    }
}

struct ControlReader {
    stream: ReadHalf<MuxStream>,
    buffer: BytesMut,
}

/// A multiplexed session.
///
/// Created over an already-upgraded WebSocket with [`Session::connect`].
/// Background tasks own the socket; the session is alive until either side
/// closes it, the socket fails, or a keepalive ping goes unanswered.
pub struct Session {
    shared: Arc<SessionShared>,
    role: Role,
    created_at: Instant,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    control_writer: tokio::sync::Mutex<WriteHalf<MuxStream>>,
    control_reader: tokio::sync::Mutex<ControlReader>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.shared.session_id)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Start a session over `socket` and establish its control stream.
    ///
    /// The initiator opens the control stream; the acceptor waits for it for
    /// at most `config.control_timeout`.
    pub async fn connect<S: WireSocket>(
        socket: S,
        role: Role,
        config: SessionConfig,
    ) -> TransportResult<Self> {
        let session_id = format!("ws-{}", uuid::Uuid::new_v4());
        let (sink, source) = socket.into_wire();

        let (frame_tx, frame_rx) = mpsc::channel(config.frame_buffer);
        let (accept_tx, mut accept_rx) = mpsc::channel(config.accept_backlog);

        // Acceptor uses even stream IDs, initiator uses odd
        let first_stream_id = match role {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        };

        let shared = Arc::new(SessionShared {
            session_id,
            frame_tx,
            closed: CancellationToken::new(),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(first_stream_id),
            pong: Notify::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        });

        tokio::spawn(writer_task(sink, frame_rx, shared.clone()));
        tokio::spawn(reader_task(source, accept_tx, shared.clone()));
        tokio::spawn(keepalive_task(
            shared.clone(),
            config.keepalive_interval,
            config.pong_timeout,
        ));

        let control = match role {
            Role::Initiator => timeout(config.control_timeout, shared.open_stream()).await,
            Role::Acceptor => {
                timeout(config.control_timeout, async {
                    accept_rx.recv().await.ok_or(TransportError::SessionClosed)
                })
                .await
            }
        };

        let control = match control {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                shared.close();
                return Err(e);
            }
            Err(_) => {
                shared.close();
                return Err(TransportError::Timeout("waiting for control stream"));
            }
        };

        debug!(
            session = %shared.session_id,
            ?role,
            control_stream = control.stream_id(),
            "Session established"
        );

        let (reader, writer) = tokio::io::split(control);

        Ok(Self {
            shared,
            role,
            created_at: Instant::now(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            control_writer: tokio::sync::Mutex::new(writer),
            control_reader: tokio::sync::Mutex::new(ControlReader {
                stream: reader,
                buffer: BytesMut::with_capacity(1024),
            }),
        })
    }

    /// Session id used in logs
    pub fn id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> TransportResult<MuxStream> {
        self.shared.open_stream().await
    }

    /// Wait for the next stream opened by the peer
    pub async fn accept_stream(&self) -> TransportResult<MuxStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = accept_rx.recv() => stream.ok_or(TransportError::SessionClosed),
            _ = self.shared.closed.cancelled() => Err(TransportError::SessionClosed),
        }
    }

    /// Write one control message. Safe to call from several tasks at once;
    /// each message goes out whole.
    pub async fn send_control(&self, msg: &ControlMessage) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }

        let line = ControlCodec::encode(msg)?;
        let mut writer = self.control_writer.lock().await;
        if let Err(e) = writer.write_all(&line).await {
            debug!(session = %self.id(), "Control write failed: {}", e);
            self.close();
            return Err(TransportError::SessionClosed);
        }

        trace!(session = %self.id(), kind = %msg.kind(), "Sent control message");
        Ok(())
    }

    /// Read the next control message.
    ///
    /// Malformed or oversized lines terminate the session.
    pub async fn receive_control(&self) -> TransportResult<ControlMessage> {
        let mut reader = self.control_reader.lock().await;
        let ControlReader { stream, buffer } = &mut *reader;

        loop {
            match ControlCodec::decode(buffer) {
                Ok(Some(msg)) => {
                    trace!(session = %self.id(), kind = %msg.kind(), "Received control message");
                    return Ok(msg);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session = %self.id(), "Invalid control message: {}", e);
                    self.close();
                    return Err(e.into());
                }
            }

            match stream.read_buf(buffer).await {
                Ok(0) => {
                    self.close();
                    return Err(TransportError::SessionClosed);
                }
                Ok(_) => {}
                Err(e) => {
                    self.close();
                    return Err(TransportError::IoError(e));
                }
            }
        }
    }

    /// Close the session and every stream on it. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the session has closed, for whatever reason
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            active_streams: self.shared.streams().len(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Writer task - sends frames to the WebSocket
async fn writer_task(
    mut sink: WireSink,
    mut rx: mpsc::Receiver<WireMessage>,
    shared: Arc<SessionShared>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shared.closed.cancelled() => break,
        };

        let len = frame.len();
        let send = sink.send(frame);
        tokio::pin!(send);

        let result = tokio::select! {
            result = &mut send => result,
            _ = shared.closed.cancelled() => match timeout(CLOSE_FLUSH_TIMEOUT, &mut send).await {
                Ok(result) => result,
                Err(_) => break,
            },
        };

        if let Err(e) = result {
            debug!(session = %shared.session_id, "WebSocket send error: {}", e);
            shared.close();
            return;
        }
        shared.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    // Flush what was queued before the close, then say goodbye
    let drain = async {
        while let Ok(frame) = rx.try_recv() {
            if sink.send(frame).await.is_err() {
                return;
            }
        }
        let _ = sink.send(WireMessage::Close).await;
        let _ = sink.close().await;
    };
    let _ = timeout(CLOSE_FLUSH_TIMEOUT, drain).await;

    shared.close();
    debug!(session = %shared.session_id, "WebSocket writer task ended");
}

/// Reader task - receives frames and dispatches them to streams
async fn reader_task(
    mut source: WireSource,
    accept_tx: mpsc::Sender<MuxStream>,
    shared: Arc<SessionShared>,
) {
    loop {
        let message = tokio::select! {
            message = source.next() => message,
            _ = shared.closed.cancelled() => break,
        };

        let data = match message {
            Some(Ok(WireMessage::Binary(data))) => data,
            Some(Ok(WireMessage::Ping(payload))) => {
                let _ = shared.frame_tx.try_send(WireMessage::Pong(payload));
                continue;
            }
            Some(Ok(WireMessage::Pong(_))) => {
                shared.pong.notify_one();
                continue;
            }
            Some(Ok(WireMessage::Close)) | None => {
                debug!(session = %shared.session_id, "WebSocket closed by peer");
                break;
            }
            Some(Err(e)) => {
                debug!(session = %shared.session_id, "WebSocket receive error: {}", e);
                break;
            }
        };

        shared
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let Some((stream_id, kind)) = decode_frame_header(&data) else {
            warn!(session = %shared.session_id, "Dropping short frame ({} bytes)", data.len());
            continue;
        };

        // Nothing in here may wait on a single stream
        match kind {
            FRAME_OPEN => {
                let stream = shared.register_stream(stream_id);
                trace!(session = %shared.session_id, stream_id, "Peer opened stream");

                match accept_tx.try_send(stream) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(stream)) => {
                        // Dropping the stream half-closes it toward the peer
                        warn!(session = %shared.session_id, stream_id, "Accept backlog full, refusing stream");
                        drop(stream);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(session = %shared.session_id, "Accept queue closed");
                        break;
                    }
                }
            }
            FRAME_DATA => {
                let payload = data.slice(FRAME_HEADER_LEN..);
                if payload.is_empty() {
                    continue;
                }

                let mut streams = shared.streams();
                let Some(entry) = streams.get(&stream_id) else {
                    trace!(session = %shared.session_id, stream_id, "Data for unknown stream");
                    continue;
                };

                if entry.window.receive(payload.len()) {
                    if entry.tx.send(payload).is_err() {
                        trace!(session = %shared.session_id, stream_id, "Stream receiver dropped");
                    }
                } else {
                    // Dropping the sender aborts the local reader
                    warn!(session = %shared.session_id, stream_id, "Peer overran stream window, resetting stream");
                    streams.remove(&stream_id);
                    drop(streams);
                    let frame = encode_frame(stream_id, FRAME_FIN, &[]);
                    send_frame_detached(&shared.frame_tx, WireMessage::Binary(frame));
                }
            }
            FRAME_FIN => {
                // The entry stays so window frames still reach our writer
                if let Some(entry) = shared.streams().get(&stream_id) {
                    // Signal stream close with empty bytes
                    let _ = entry.tx.send(Bytes::new());
                }
            }
            FRAME_WINDOW => {
                let Some(credit) = decode_window_update(&data[FRAME_HEADER_LEN..]) else {
                    warn!(session = %shared.session_id, stream_id, "Malformed window frame");
                    continue;
                };
                if let Some(entry) = shared.streams().get(&stream_id) {
                    entry.window.grant(credit);
                }
            }
            other => {
                warn!(session = %shared.session_id, "Unknown frame kind: {}", other);
            }
        }
    }

    shared.close();

    // Dropping the senders makes pending reads fail
    let streams = std::mem::take(&mut *shared.streams());
    drop(streams);
    debug!(session = %shared.session_id, "WebSocket reader task ended");
}

/// Keepalive task - pings the peer and closes the session when no pong
/// arrives in time
async fn keepalive_task(shared: Arc<SessionShared>, interval: Duration, pong_timeout: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.closed.cancelled() => return,
        }

        if shared.frame_tx.send(WireMessage::Ping(Bytes::new())).await.is_err() {
            return;
        }

        tokio::select! {
            result = timeout(pong_timeout, shared.pong.notified()) => {
                if result.is_err() {
                    warn!(
                        session = %shared.session_id,
                        "No pong within {:?}, closing session",
                        pong_timeout
                    );
                    shared.close();
                    return;
                }
            }
            _ = shared.closed.cancelled() => return,
        }
    }
}
