use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_ENGINE_PORT: u16 = 443;
const DEFAULT_WS_TIMEOUT_SECS: f64 = 8.0;
const DEFAULT_WS_RETRIES: usize = 2;
const DEFAULT_HTTP_TIMEOUT_SECS: f64 = 30.0;
const MAX_ENDPOINT_CANDIDATES: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("QLIK_SERVER_URL environment variable is required")]
    MissingServerUrl,
    #[error("invalid QLIK_SERVER_URL: {0}")]
    InvalidServerUrl(String),
    #[error(
        "no authentication configured: set QLIK_API_KEY, or QLIK_USER_DIRECTORY and QLIK_USER_ID with client certificates"
    )]
    MissingAuth,
}

/// Connection settings for a Qlik tenant, shared by the Engine WebSocket
/// client and the Cloud REST client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QlikConfig {
    /// Tenant URL, e.g. `https://tenant.qlikcloud.com`.
    pub server_url: String,
    /// Bearer credential. When set, certificate auth is not used.
    pub api_key: Option<String>,
    /// Impersonation header pair for certificate-based deployments.
    pub user_directory: Option<String>,
    pub user_id: Option<String>,
    pub engine_port: u16,
    pub verify_ssl: bool,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub ca_cert_path: Option<String>,
    /// Per connect attempt and per RPC call.
    pub ws_timeout_secs: f64,
    /// Candidate-endpoint budget, clamped to [1, 4].
    pub ws_retries: usize,
    pub http_timeout_secs: f64,
}

impl QlikConfig {
    /// Read configuration from `QLIK_*` environment variables.
    ///
    /// Malformed numeric values fall back to defaults rather than failing;
    /// a missing server URL or missing auth material is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url = std::env::var("QLIK_SERVER_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingServerUrl)?;

        let config = Self {
            server_url,
            api_key: env_nonempty("QLIK_API_KEY"),
            user_directory: env_nonempty("QLIK_USER_DIRECTORY"),
            user_id: env_nonempty("QLIK_USER_ID"),
            engine_port: parse_env("QLIK_ENGINE_PORT", DEFAULT_ENGINE_PORT),
            verify_ssl: parse_env_bool("QLIK_VERIFY_SSL", true),
            client_cert_path: env_nonempty("QLIK_CLIENT_CERT_PATH"),
            client_key_path: env_nonempty("QLIK_CLIENT_KEY_PATH"),
            ca_cert_path: env_nonempty("QLIK_CA_CERT_PATH"),
            ws_timeout_secs: parse_env("QLIK_WS_TIMEOUT", DEFAULT_WS_TIMEOUT_SECS),
            ws_retries: parse_env("QLIK_WS_RETRIES", DEFAULT_WS_RETRIES),
            http_timeout_secs: parse_env("QLIK_HTTP_TIMEOUT", DEFAULT_HTTP_TIMEOUT_SECS),
        };
        config.require_auth()?;
        Ok(config)
    }

    fn require_auth(&self) -> Result<(), ConfigError> {
        let has_impersonation = self.user_directory.is_some() && self.user_id.is_some();
        if self.api_key.is_none() && !has_impersonation {
            return Err(ConfigError::MissingAuth);
        }
        Ok(())
    }

    /// Host portion of the server URL, with any scheme stripped.
    pub fn server_host(&self) -> Result<String, ConfigError> {
        let trimmed = self.server_url.trim_end_matches('/');
        if let Ok(url) = Url::parse(trimmed) {
            if let Some(host) = url.host_str() {
                return Ok(host.to_string());
            }
        }
        // Bare hostnames are accepted as-is.
        let stripped = trimmed
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        if stripped.is_empty() {
            return Err(ConfigError::InvalidServerUrl(self.server_url.clone()));
        }
        Ok(stripped.to_string())
    }

    /// Ordered WebSocket endpoint candidates, most secure and specific
    /// first, truncated to the configured retry budget.
    pub fn engine_endpoints(&self) -> Result<Vec<String>, ConfigError> {
        let host = self.server_host()?;
        let port = self.engine_port;
        let all = [
            format!("wss://{host}:{port}/app/engineData"),
            format!("wss://{host}:{port}/app"),
            format!("ws://{host}:{port}/app/engineData"),
            format!("ws://{host}:{port}/app"),
        ];
        let budget = self.ws_retries.clamp(1, MAX_ENDPOINT_CANDIDATES);
        Ok(all.into_iter().take(budget).collect())
    }

    pub fn ws_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ws_timeout_secs.max(0.0))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.http_timeout_secs.max(0.0))
    }

    /// Whether certificate auth applies (no API key, identity configured).
    pub fn uses_client_certificate(&self) -> bool {
        self.api_key.is_none()
            && self.client_cert_path.is_some()
            && self.client_key_path.is_some()
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
