use crate::allowlist::Allowlist;
use rtunnel_transport::{bridge, MuxStream};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Errors that can occur during TCP forwarding
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to remote address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to remote address {0}")]
    ConnectTimeout(String),

    #[error("Address not allowed: {0}")]
    AddressNotAllowed(String),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// Dials allowed targets and bridges them to relay streams
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    allowlist: Allowlist,
    connect_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(allowlist: Allowlist, connect_timeout: Duration) -> Self {
        Self {
            allowlist,
            connect_timeout,
        }
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    /// Open a TCP connection to `remote_address` if the allow-list permits it
    pub async fn connect(&self, remote_address: &str) -> Result<TcpStream, ForwarderError> {
        if !self.allowlist.is_allowed(remote_address) {
            return Err(ForwarderError::AddressNotAllowed(
                remote_address.to_string(),
            ));
        }

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(remote_address)).await
        {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ForwarderError::ConnectionFailed {
                address: remote_address.to_string(),
                source: e,
            }),
            Err(_) => Err(ForwarderError::ConnectTimeout(remote_address.to_string())),
        }
    }

    /// Forward traffic between a relay stream and a connected target
    pub async fn forward(
        &self,
        stream_id: &str,
        remote_address: &str,
        tunnel_stream: MuxStream,
        remote_stream: TcpStream,
    ) -> Result<(), ForwarderError> {
        tracing::debug!(
            stream_id = %stream_id,
            target_addr = %remote_address,
            "Starting TCP forward"
        );

        let stats = bridge(tunnel_stream, remote_stream).await?;

        tracing::info!(
            stream_id = %stream_id,
            target_addr = %remote_address,
            bytes_to_remote = stats.a_to_b,
            bytes_to_tunnel = stats.b_to_a,
            "TCP forward completed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_forwarder_error_display() {
        let err = ForwarderError::AddressNotAllowed("192.168.1.1:8080".to_string());
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_disallowed_address_is_not_dialed() {
        let forwarder = TcpForwarder::new(Allowlist::default(), Duration::from_secs(1));
        let result = forwarder.connect("10.255.255.1:22").await;
        assert!(matches!(result, Err(ForwarderError::AddressNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_connects_to_allowed_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let forwarder = TcpForwarder::new(Allowlist::default(), Duration::from_secs(1));
        assert!(forwarder.connect(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_refused_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let forwarder = TcpForwarder::new(Allowlist::default(), Duration::from_secs(1));
        assert!(matches!(
            forwarder.connect(&addr).await,
            Err(ForwarderError::ConnectionFailed { .. })
        ));
    }
}
