//! Dialing a relay over ws:// or wss://

use rtunnel_proto::TOKEN_HEADER;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::{tungstenite, Connector, MaybeTlsStream};
use tracing::debug;
use url::Url;

use crate::config::TransportConfig;
use crate::session::{Role, Session};
use crate::{TransportError, TransportResult};

/// WebSocket produced by [`connect_websocket`]
pub type ClientWebSocket = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to `url`, presenting `token` in the tunnel token header.
///
/// A 401 from the relay maps to [`TransportError::AuthenticationFailed`].
pub async fn connect_websocket(
    url: &str,
    token: &str,
    config: &TransportConfig,
) -> TransportResult<ClientWebSocket> {
    let parsed = Url::parse(url).map_err(|e| {
        TransportError::ConfigurationError(format!("Invalid relay URL {}: {}", url, e))
    })?;

    let secure = match parsed.scheme() {
        "wss" => true,
        "ws" => false,
        other => {
            return Err(TransportError::ConfigurationError(format!(
                "Unsupported URL scheme '{}' (expected ws or wss)",
                other
            )))
        }
    };

    let mut request = parsed
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

    let header_name = HeaderName::from_bytes(TOKEN_HEADER.as_bytes())
        .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
    let header_value = HeaderValue::from_str(token).map_err(|_| {
        TransportError::ConfigurationError("Token is not a valid header value".to_string())
    })?;
    request.headers_mut().insert(header_name, header_value);

    let connector = if secure {
        Some(Connector::Rustls(Arc::new(config.build_client_tls()?)))
    } else {
        None
    };

    debug!("Connecting to relay at {}", parsed);

    let (ws, response) = timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector),
    )
    .await
    .map_err(|_| TransportError::Timeout("connecting to relay"))?
    .map_err(map_handshake_error)?;

    debug!("WebSocket upgrade complete ({})", response.status());
    Ok(ws)
}

/// Dial `url` and run a [`Session`] over it as the initiator
pub async fn dial_session(
    url: &str,
    token: &str,
    config: &TransportConfig,
) -> TransportResult<Session> {
    let ws = connect_websocket(url, token, config).await?;
    Session::connect(ws, Role::Initiator, config.session.clone()).await
}

fn map_handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            TransportError::AuthenticationFailed("relay rejected the token".to_string())
        }
        tungstenite::Error::Http(response) => TransportError::ConnectionError(format!(
            "WebSocket upgrade refused with HTTP {}",
            response.status()
        )),
        tungstenite::Error::Io(e) => TransportError::IoError(e),
        tungstenite::Error::Tls(e) => TransportError::TlsError(e.to_string()),
        other => TransportError::ConnectionError(format!("WebSocket handshake failed: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_websocket_scheme() {
        let result = connect_websocket("http://127.0.0.1:1/ws", "t", &TransportConfig::default()).await;
        assert!(matches!(result, Err(TransportError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_rejects_unparseable_url() {
        let result = connect_websocket("not a url", "t", &TransportConfig::default()).await;
        assert!(matches!(result, Err(TransportError::ConfigurationError(_))));
    }
}
