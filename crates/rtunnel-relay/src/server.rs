//! HTTP(S) front of the relay: WebSocket upgrades and health check

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{future, SinkExt, StreamExt};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rtunnel_proto::{AGENT_PATH, CLIENT_PATH, HEALTH_PATH, TOKEN_HEADER};
use rtunnel_transport::{
    Role, Session, TransportError, WireMessage, WireSink, WireSocket, WireSource,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::RelayError;

/// axum WebSocket adapted for [`Session`]
pub struct AxumSocket(pub WebSocket);

impl WireSocket for AxumSocket {
    fn into_wire(self) -> (WireSink, WireSource) {
        let (sink, source) = StreamExt::split(self.0);

        let sink = sink
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|msg: WireMessage| {
                future::ready(Ok::<_, TransportError>(match msg {
                    WireMessage::Binary(data) => Message::Binary(data),
                    WireMessage::Ping(data) => Message::Ping(data),
                    WireMessage::Pong(data) => Message::Pong(data),
                    WireMessage::Close => Message::Close(None),
                }))
            });

        let source = source.filter_map(|result| {
            future::ready(match result {
                Ok(Message::Binary(data)) => Some(Ok(WireMessage::Binary(data))),
                Ok(Message::Ping(data)) => Some(Ok(WireMessage::Ping(data))),
                Ok(Message::Pong(data)) => Some(Ok(WireMessage::Pong(data))),
                Ok(Message::Close(_)) => Some(Ok(WireMessage::Close)),
                Ok(Message::Text(_)) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        (Box::pin(sink), Box::pin(source))
    }
}

#[derive(Debug, Clone, Copy)]
enum Peer {
    Agent,
    Client,
}

pub(crate) fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(AGENT_PATH, get(agent_upgrade))
        .route(CLIENT_PATH, get(client_upgrade))
        .with_state(broker)
}

async fn health() -> &'static str {
    "OK"
}

async fn agent_upgrade(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    upgrade(broker, &headers, ws, Peer::Agent)
}

async fn client_upgrade(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    upgrade(broker, &headers, ws, Peer::Client)
}

fn upgrade(
    broker: Arc<Broker>,
    headers: &HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    peer: Peer,
) -> Response {
    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if !broker.token_matches(presented) {
        warn!(?peer, "Rejecting WebSocket upgrade with invalid token");
        return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let session_config = broker.config().session.clone();
        let session = match Session::connect(AxumSocket(socket), Role::Acceptor, session_config).await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(?peer, "Session setup failed: {}", e);
                return;
            }
        };

        match peer {
            Peer::Agent => broker.handle_agent(session).await,
            Peer::Client => broker.handle_client(session).await,
        }
    })
}

/// Serve plain HTTP until `shutdown` fires
pub(crate) async fn serve_plain(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Serve HTTPS until `shutdown` fires
pub(crate) async fn serve_tls(
    listener: TcpListener,
    app: Router,
    acceptor: TlsAcceptor,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        let (tcp_stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(%peer_addr, "TLS handshake failed: {}", e);
                    return;
                }
            };

            let connection = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), TowerToHyperService::new(app))
                .with_upgrades();
            tokio::pin!(connection);

            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(e) = result {
                        debug!(%peer_addr, "Connection error: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    let _ = connection.await;
                }
            }
        });
    }

    info!("Relay listener stopped");
    Ok(())
}
