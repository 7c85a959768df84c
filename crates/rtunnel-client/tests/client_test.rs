//! Client and listener tests against a live relay and agent

use rtunnel_agent::{Agent, AgentConfig};
use rtunnel_client::{
    ClientConfig, ClientError, ListenerConfig, ReconnectConfig, TunnelClient, TunnelListener,
};
use rtunnel_relay::{Relay, RelayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TOKEN: &str = "client-test-token";
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn start_relay_on(listener: TcpListener) -> Arc<Relay> {
    let addr = listener.local_addr().unwrap();
    let relay = Arc::new(Relay::new(RelayConfig::new(addr, TOKEN)));

    let serving = relay.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    relay
}

async fn start_relay() -> (Arc<Relay>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (start_relay_on(listener).await, addr)
}

async fn start_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

async fn start_agent(relay: &Relay, relay_addr: SocketAddr, agent_id: &str) -> Arc<Agent> {
    let config = AgentConfig::new(agent_id, format!("ws://{}/ws/agent", relay_addr), TOKEN)
        .with_reconnect_delay(Duration::from_millis(100));
    let agent = Arc::new(Agent::new(config).unwrap());

    let running = agent.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });

    timeout(WAIT, async {
        while !relay.agent_ids().iter().any(|id| id == agent_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never registered");

    agent
}

fn client_config(relay_addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(format!("ws://{}/ws/client", relay_addr), TOKEN)
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        multiplier: 2.0,
    }
}

async fn echo_roundtrip<S>(stream: &mut S, payload: &[u8])
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_stream_echo() {
    init_tracing();
    let (relay, relay_addr) = start_relay().await;
    let echo = start_echo_server().await;
    let agent = start_agent(&relay, relay_addr, "agent-a").await;

    let client = TunnelClient::connect(client_config(relay_addr)).await.unwrap();
    let mut stream = client.request_stream("agent-a", &echo).await.unwrap();
    echo_roundtrip(&mut stream, b"ping over the relay").await;

    client.close();
    agent.shutdown();
    relay.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_session() {
    init_tracing();
    let (relay, relay_addr) = start_relay().await;
    let echo = start_echo_server().await;
    let agent = start_agent(&relay, relay_addr, "agent-b").await;

    let client = Arc::new(TunnelClient::connect(client_config(relay_addr)).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        let echo = echo.clone();
        handles.push(tokio::spawn(async move {
            let mut stream = client.request_stream("agent-b", &echo).await.unwrap();
            let payload = format!("stream number {}", i);
            echo_roundtrip(&mut stream, payload.as_bytes()).await;
        }));
    }
    for handle in handles {
        timeout(WAIT, handle).await.unwrap().unwrap();
    }

    client.close();
    agent.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_unknown_agent_is_refused() {
    init_tracing();
    let (relay, relay_addr) = start_relay().await;

    let client = TunnelClient::connect(client_config(relay_addr)).await.unwrap();
    let result = timeout(WAIT, client.request_stream("nobody", "127.0.0.1:22"))
        .await
        .unwrap();

    match result {
        Err(ClientError::Refused { reason, .. }) => assert_eq!(reason, "Agent not found"),
        other => panic!("expected refusal, got {:?}", other.map(|_| ())),
    }

    client.close();
    relay.shutdown();
}

#[tokio::test]
async fn test_disallowed_target_is_refused() {
    init_tracing();
    let (relay, relay_addr) = start_relay().await;
    let agent = start_agent(&relay, relay_addr, "agent-c").await;

    let client = TunnelClient::connect(client_config(relay_addr)).await.unwrap();
    let result = timeout(WAIT, client.request_stream("agent-c", "192.0.2.1:22"))
        .await
        .unwrap();
    assert!(matches!(result, Err(ClientError::Refused { .. })));

    client.close();
    agent.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_relay_shutdown_fails_pending_requests() {
    init_tracing();
    let (relay, relay_addr) = start_relay().await;

    let client = TunnelClient::connect(client_config(relay_addr)).await.unwrap();
    relay.shutdown();

    timeout(WAIT, client.closed()).await.unwrap();
    let result = client.request_stream("agent", "127.0.0.1:22").await;
    assert!(matches!(result, Err(ClientError::SessionClosed)));
}

#[tokio::test]
async fn test_bad_token_fails_connect() {
    init_tracing();
    let (relay, relay_addr) = start_relay().await;

    let config = ClientConfig::new(format!("ws://{}/ws/client", relay_addr), "wrong");
    let result = TunnelClient::connect(config).await;
    assert!(matches!(result, Err(ClientError::Transport(_))));

    relay.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listener_forwards_local_connections() {
    init_tracing();
    let (relay, relay_addr) = start_relay().await;
    let echo = start_echo_server().await;
    let agent = start_agent(&relay, relay_addr, "agent-d").await;

    let config = ListenerConfig::new("127.0.0.1:0", "agent-d", echo, client_config(relay_addr))
        .with_reconnect(fast_reconnect());
    let listener = Arc::new(TunnelListener::bind(config).await.unwrap());
    let local_addr = listener.local_addr().unwrap();

    let running = listener.clone();
    let task = tokio::spawn(async move { running.run().await });

    for round in 0..3 {
        let mut socket = TcpStream::connect(local_addr).await.unwrap();
        echo_roundtrip(&mut socket, format!("round {}", round).as_bytes()).await;
    }

    listener.shutdown();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    agent.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_listener_drops_connection_without_session() {
    init_tracing();

    // Nothing listens on this address
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = unused.local_addr().unwrap();
    drop(unused);

    let config = ListenerConfig::new("127.0.0.1:0", "agent", "127.0.0.1:22", client_config(relay_addr))
        .with_session_wait(Duration::from_millis(200))
        .with_reconnect(fast_reconnect());
    let listener = Arc::new(TunnelListener::bind(config).await.unwrap());
    let local_addr = listener.local_addr().unwrap();

    let running = listener.clone();
    tokio::spawn(async move { running.run().await });

    let mut socket = TcpStream::connect(local_addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, socket.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(!listener.has_session());

    listener.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listener_reconnects_when_relay_appears() {
    init_tracing();

    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let echo = start_echo_server().await;
    let config = ListenerConfig::new("127.0.0.1:0", "agent-e", echo, client_config(relay_addr))
        .with_reconnect(fast_reconnect());
    let listener = Arc::new(TunnelListener::bind(config).await.unwrap());
    let local_addr = listener.local_addr().unwrap();

    let running = listener.clone();
    tokio::spawn(async move { running.run().await });

    // Let a few connection attempts fail first
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!listener.has_session());

    let relay = start_relay_on(TcpListener::bind(relay_addr).await.unwrap()).await;
    let agent = start_agent(&relay, relay_addr, "agent-e").await;

    timeout(WAIT, async {
        while !listener.has_session() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listener never connected");

    let mut socket = TcpStream::connect(local_addr).await.unwrap();
    echo_roundtrip(&mut socket, b"late relay").await;

    listener.shutdown();
    agent.shutdown();
    relay.shutdown();
}
