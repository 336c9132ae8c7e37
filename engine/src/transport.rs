use futures_util::{SinkExt, StreamExt};
use qlik_core::QlikConfig;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};

use crate::error::EngineError;

/// A negotiated duplex connection to the engine.
///
/// Owned exclusively by one `Connection`; never shared across logical
/// sessions.
#[derive(Debug)]
pub struct Transport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    endpoint: String,
}

impl Transport {
    /// Try each candidate endpoint in priority order and return the first
    /// live connection. The server's initial session frame is consumed
    /// before returning, so the transport is ready for request traffic.
    pub async fn negotiate(config: &QlikConfig) -> Result<Self, EngineError> {
        let candidates = config.engine_endpoints()?;
        let connector = build_tls_connector(config)?;
        let timeout = config.ws_timeout();

        let mut last_error = String::from("no endpoints to try");
        for endpoint in candidates {
            let attempt = tokio::time::timeout(
                timeout,
                connect_candidate(&endpoint, config, connector.clone()),
            )
            .await;
            match attempt {
                Ok(Ok(mut stream)) => {
                    // Initial recv establishes the session.
                    match tokio::time::timeout(timeout, stream.next()).await {
                        Ok(Some(Ok(_session_frame))) => {
                            tracing::debug!(endpoint, "engine transport established");
                            return Ok(Self { stream, endpoint });
                        }
                        Ok(Some(Err(e))) => last_error = e.to_string(),
                        Ok(None) => last_error = "connection closed during handshake".to_string(),
                        Err(_) => last_error = "timed out waiting for session frame".to_string(),
                    }
                    let _ = stream.close(None).await;
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = format!("connect to {endpoint} timed out"),
            }
            tracing::debug!(endpoint, error = %last_error, "engine endpoint candidate failed");
        }

        Err(EngineError::Connection { last_error })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn send_text(&mut self, payload: String) -> Result<(), EngineError> {
        self.stream
            .send(Message::Text(payload))
            .await
            .map_err(|e| EngineError::ConnectionLost(e.to_string()))
    }

    /// Receive the next text frame, skipping control frames. `Ok(None)`
    /// means the peer closed the connection.
    pub async fn recv_text(&mut self) -> Result<Option<String>, EngineError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map(Some)
                        .map_err(|e| EngineError::ConnectionLost(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(EngineError::ConnectionLost(e.to_string())),
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

async fn connect_candidate(
    endpoint: &str,
    config: &QlikConfig,
    connector: Option<Connector>,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, String> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| e.to_string())?;

    if let Some(api_key) = &config.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| e.to_string())?;
        request.headers_mut().insert("Authorization", value);
    } else if let (Some(directory), Some(user)) = (&config.user_directory, &config.user_id) {
        let value =
            HeaderValue::from_str(&format!("UserDirectory={directory}; UserId={user}"))
                .map_err(|e| e.to_string())?;
        request.headers_mut().insert("X-Qlik-User", value);
    }

    let (stream, _response) = connect_async_tls_with_config(request, None, false, connector)
        .await
        .map_err(|e| e.to_string())?;
    Ok(stream)
}

fn build_tls_connector(config: &QlikConfig) -> Result<Option<Connector>, EngineError> {
    let mut builder = native_tls::TlsConnector::builder();

    if !config.verify_ssl {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read(ca_path)
            .map_err(|e| EngineError::Config(format!("cannot read CA bundle {ca_path}: {e}")))?;
        let cert = native_tls::Certificate::from_pem(&pem)
            .map_err(|e| EngineError::Config(format!("invalid CA bundle {ca_path}: {e}")))?;
        builder.add_root_certificate(cert);
    }

    if config.uses_client_certificate() {
        // Both paths are present per uses_client_certificate.
        let cert_path = config.client_cert_path.as_deref().unwrap_or_default();
        let key_path = config.client_key_path.as_deref().unwrap_or_default();
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            EngineError::Config(format!("cannot read client certificate {cert_path}: {e}"))
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| {
            EngineError::Config(format!("cannot read client key {key_path}: {e}"))
        })?;
        let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
            .map_err(|e| EngineError::Config(format!("invalid client identity: {e}")))?;
        builder.identity(identity);
    }

    let connector = builder
        .build()
        .map_err(|e| EngineError::Config(format!("TLS setup failed: {e}")))?;
    Ok(Some(Connector::NativeTls(connector)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> QlikConfig {
        QlikConfig {
            server_url: "https://127.0.0.1".to_string(),
            api_key: Some("key".to_string()),
            user_directory: None,
            user_id: None,
            // Reserved port, nothing listens there in the test environment.
            engine_port: 1,
            verify_ssl: false,
            client_cert_path: None,
            client_key_path: None,
            ca_cert_path: None,
            ws_timeout_secs: 0.5,
            ws_retries: 4,
            http_timeout_secs: 1.0,
        }
    }

    #[tokio::test]
    async fn all_candidates_refused_yields_connection_error() {
        let config = unreachable_config();
        let err = Transport::negotiate(&config).await.unwrap_err();
        match err {
            EngineError::Connection { last_error } => assert!(!last_error.is_empty()),
            other => panic!("expected Connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn negotiation_is_idempotent_on_failure() {
        let config = unreachable_config();
        let first = Transport::negotiate(&config).await.unwrap_err();
        let second = Transport::negotiate(&config).await.unwrap_err();
        assert!(matches!(first, EngineError::Connection { .. }));
        assert!(matches!(second, EngineError::Connection { .. }));
    }
}
