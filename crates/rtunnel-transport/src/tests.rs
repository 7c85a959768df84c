//! Session tests over an in-memory WebSocket stand-in

use crate::stream::{encode_frame, FRAME_DATA, FRAME_OPEN, MAX_FRAME_PAYLOAD};
use crate::*;
use futures::{future, SinkExt, StreamExt};
use rtunnel_proto::{ControlMessage, MessageType};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// One end of an in-memory WebSocket
struct MemorySocket {
    tx: mpsc::Sender<WireMessage>,
    rx: mpsc::Receiver<WireMessage>,
    ignore_pings: bool,
}

impl WireSocket for MemorySocket {
    fn into_wire(self) -> (WireSink, WireSource) {
        let sink = PollSender::new(self.tx).sink_map_err(|_| TransportError::SessionClosed);

        let ignore_pings = self.ignore_pings;
        let source = futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|msg| (Ok(msg), rx))
        })
        .filter(move |msg| {
            future::ready(!(ignore_pings && matches!(msg, Ok(WireMessage::Ping(_)))))
        });

        (Box::pin(sink), Box::pin(source))
    }
}

fn memory_pair() -> (MemorySocket, MemorySocket) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (
        MemorySocket {
            tx: a_tx,
            rx: b_rx,
            ignore_pings: false,
        },
        MemorySocket {
            tx: b_tx,
            rx: a_rx,
            ignore_pings: false,
        },
    )
}

async fn session_pair(config: SessionConfig) -> (Session, Session) {
    let (a, b) = memory_pair();
    let (initiator, acceptor) = tokio::join!(
        Session::connect(a, Role::Initiator, config.clone()),
        Session::connect(b, Role::Acceptor, config),
    );
    (initiator.unwrap(), acceptor.unwrap())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn test_control_messages_flow_both_ways() {
    init_tracing();
    let (initiator, acceptor) = session_pair(SessionConfig::default()).await;

    initiator
        .send_control(&ControlMessage::register("agent-1", "secret"))
        .await
        .unwrap();
    let msg = acceptor.receive_control().await.unwrap();
    assert_eq!(msg.kind(), MessageType::Register);
    assert_eq!(msg.agent_id(), Some("agent-1"));

    acceptor
        .send_control(&ControlMessage::forward_dial("s-1", "127.0.0.1:22"))
        .await
        .unwrap();
    let msg = initiator.receive_control().await.unwrap();
    assert_eq!(msg.kind(), MessageType::Dial);
    assert_eq!(msg.stream_id(), Some("s-1"));
}

#[tokio::test]
async fn test_stream_ids_follow_role_parity() {
    let (initiator, acceptor) = session_pair(SessionConfig::default()).await;

    let a = initiator.open_stream().await.unwrap();
    let b = initiator.open_stream().await.unwrap();
    let c = acceptor.open_stream().await.unwrap();

    // Stream 1 is the control stream
    assert_eq!(a.stream_id(), 3);
    assert_eq!(b.stream_id(), 5);
    assert_eq!(c.stream_id(), 2);

    assert_eq!(acceptor.accept_stream().await.unwrap().stream_id(), 3);
    assert_eq!(acceptor.accept_stream().await.unwrap().stream_id(), 5);
    assert_eq!(initiator.accept_stream().await.unwrap().stream_id(), 2);
}

#[tokio::test]
async fn test_stream_half_close() {
    let (initiator, acceptor) = session_pair(SessionConfig::default()).await;

    let mut outbound = initiator.open_stream().await.unwrap();
    let mut inbound = acceptor.accept_stream().await.unwrap();

    outbound.write_all(b"request").await.unwrap();
    outbound.shutdown().await.unwrap();

    let mut received = Vec::new();
    inbound.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"request");

    // The reverse direction is still open
    inbound.write_all(b"response").await.unwrap();
    drop(inbound);

    let mut received = Vec::new();
    outbound.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"response");

    assert!(outbound.write_all(b"late").await.is_err());
}

#[tokio::test]
async fn test_streams_are_independent() {
    let (initiator, acceptor) = session_pair(SessionConfig::default()).await;

    let mut first = initiator.open_stream().await.unwrap();
    let mut second = initiator.open_stream().await.unwrap();
    let mut first_in = acceptor.accept_stream().await.unwrap();
    let mut second_in = acceptor.accept_stream().await.unwrap();

    second.write_all(b"two").await.unwrap();
    first.write_all(b"one").await.unwrap();
    drop(first);

    let mut buf = Vec::new();
    first_in.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"one");

    let mut buf = [0u8; 3];
    second_in.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");

    // Control stream unaffected by data stream teardown
    initiator.send_control(&ControlMessage::ping()).await.unwrap();
    assert_eq!(
        acceptor.receive_control().await.unwrap().kind(),
        MessageType::Ping
    );
}

#[tokio::test]
async fn test_large_write_is_split_into_frames() {
    let (initiator, acceptor) = session_pair(SessionConfig::default()).await;

    let mut outbound = initiator.open_stream().await.unwrap();
    let mut inbound = acceptor.accept_stream().await.unwrap();

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();
    tokio::spawn(async move {
        outbound.write_all(&payload).await.unwrap();
        outbound.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    inbound.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_unread_stream_does_not_stall_session() {
    init_tracing();
    let config = SessionConfig::default()
        .with_keep_alive(Duration::from_millis(100), Duration::from_millis(300));
    let (initiator, acceptor) = session_pair(config).await;

    let mut outbound = initiator.open_stream().await.unwrap();
    let mut inbound = acceptor.accept_stream().await.unwrap();

    // Far more than the peer is willing to buffer for one stream
    let payload = vec![9u8; 16 * 1024 * 1024];
    let total = payload.len();
    let writer = tokio::spawn(async move {
        outbound.write_all(&payload).await.unwrap();
        outbound.shutdown().await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());

    // Control traffic keeps flowing past the stalled stream
    initiator
        .send_control(&ControlMessage::register("agent-1", "secret"))
        .await
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(1), acceptor.receive_control())
        .await
        .expect("control stream stalled")
        .unwrap();
    assert_eq!(msg.kind(), MessageType::Register);

    acceptor.send_control(&ControlMessage::ping()).await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(1), initiator.receive_control())
        .await
        .expect("control stream stalled")
        .unwrap();
    assert_eq!(msg.kind(), MessageType::Ping);

    // Several keepalive rounds pass while the stream stays unread
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!initiator.is_closed());
    assert!(!acceptor.is_closed());

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), inbound.read_to_end(&mut received))
        .await
        .expect("stream never drained")
        .unwrap();
    assert_eq!(received.len(), total);
    writer.await.unwrap();
}

#[tokio::test]
async fn test_window_overrun_resets_only_that_stream() {
    let (a, b) = memory_pair();
    let MemorySocket { tx, rx: _rx, .. } = b;

    let peer = async {
        tx.send(WireMessage::Binary(encode_frame(1, FRAME_OPEN, &[])))
            .await
            .unwrap();
        tx.send(WireMessage::Binary(encode_frame(3, FRAME_OPEN, &[])))
            .await
            .unwrap();
        // One frame past the window, sent without waiting for credit
        let chunk = vec![1u8; MAX_FRAME_PAYLOAD];
        for _ in 0..=(STREAM_WINDOW / MAX_FRAME_PAYLOAD) {
            tx.send(WireMessage::Binary(encode_frame(3, FRAME_DATA, &chunk)))
                .await
                .unwrap();
        }
        tx.send(WireMessage::Binary(encode_frame(1, FRAME_DATA, b"{\"type\":\"PING\"}\n")))
            .await
            .unwrap();
    };
    let (session, _) = tokio::join!(
        Session::connect(a, Role::Acceptor, SessionConfig::default()),
        peer
    );
    let session = session.unwrap();

    // Control traffic queued after the flood still arrives
    let msg = tokio::time::timeout(Duration::from_secs(2), session.receive_control())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.kind(), MessageType::Ping);

    let mut stream = session.accept_stream().await.unwrap();
    assert_eq!(stream.stream_id(), 3);
    let mut received = Vec::new();
    let err = stream.read_to_end(&mut received).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    assert!(received.len() <= STREAM_WINDOW);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_close_fails_streams_and_is_idempotent() {
    let (initiator, acceptor) = session_pair(SessionConfig::default()).await;

    let mut outbound = initiator.open_stream().await.unwrap();
    let mut inbound = acceptor.accept_stream().await.unwrap();

    initiator.close();
    initiator.close();
    assert!(initiator.is_closed());

    tokio::time::timeout(Duration::from_secs(2), acceptor.closed())
        .await
        .expect("peer did not notice close");

    let mut buf = [0u8; 8];
    let err = inbound.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);

    assert!(outbound.write_all(b"x").await.is_err());
    assert!(matches!(
        initiator.open_stream().await,
        Err(TransportError::SessionClosed)
    ));
    assert!(matches!(
        acceptor.accept_stream().await,
        Err(TransportError::SessionClosed)
    ));
    assert!(matches!(
        acceptor.receive_control().await,
        Err(TransportError::SessionClosed) | Err(TransportError::IoError(_))
    ));
}

#[tokio::test]
async fn test_missing_pong_closes_session() {
    init_tracing();
    let (a, mut b) = memory_pair();
    b.ignore_pings = true;

    let fast = SessionConfig::default()
        .with_keep_alive(Duration::from_millis(50), Duration::from_millis(150));
    let slow = SessionConfig::default()
        .with_keep_alive(Duration::from_secs(3600), Duration::from_secs(3600));

    let (initiator, acceptor) = tokio::join!(
        Session::connect(a, Role::Initiator, fast),
        Session::connect(b, Role::Acceptor, slow),
    );
    let initiator = initiator.unwrap();
    let acceptor = acceptor.unwrap();

    tokio::time::timeout(Duration::from_secs(2), initiator.closed())
        .await
        .expect("keepalive did not close the session");
    tokio::time::timeout(Duration::from_secs(2), acceptor.closed())
        .await
        .expect("peer session did not follow");
}

#[tokio::test]
async fn test_answered_pings_keep_session_alive() {
    let config = SessionConfig::default()
        .with_keep_alive(Duration::from_millis(30), Duration::from_millis(200));
    let (initiator, acceptor) = session_pair(config).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!initiator.is_closed());
    assert!(!acceptor.is_closed());
}

#[tokio::test]
async fn test_acceptor_times_out_without_control_stream() {
    let (a, _b) = memory_pair();
    let config = SessionConfig::default().with_control_timeout(Duration::from_millis(100));

    let result = Session::connect(a, Role::Acceptor, config).await;
    assert!(matches!(result, Err(TransportError::Timeout(_))));
}

#[tokio::test]
async fn test_malformed_control_line_closes_session() {
    let (a, b) = memory_pair();
    let MemorySocket { tx, rx: _rx, .. } = b;

    let peer = async {
        tx.send(WireMessage::Binary(encode_frame(1, FRAME_OPEN, &[])))
            .await
            .unwrap();
        tx.send(WireMessage::Binary(encode_frame(1, FRAME_DATA, b"not json\n")))
            .await
            .unwrap();
    };
    let (session, _) = tokio::join!(
        Session::connect(a, Role::Acceptor, SessionConfig::default()),
        peer
    );
    let session = session.unwrap();

    assert!(matches!(
        session.receive_control().await,
        Err(TransportError::ProtocolError(_))
    ));
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_stats_count_traffic() {
    let (initiator, acceptor) = session_pair(SessionConfig::default()).await;

    let mut outbound = initiator.open_stream().await.unwrap();
    let mut inbound = acceptor.accept_stream().await.unwrap();
    outbound.write_all(&[7u8; 1000]).await.unwrap();
    let mut buf = [0u8; 1000];
    inbound.read_exact(&mut buf).await.unwrap();

    let stats = initiator.stats();
    assert!(stats.bytes_sent >= 1000);
    assert_eq!(stats.active_streams, 2);
    assert!(acceptor.stats().bytes_received >= 1000);
}
