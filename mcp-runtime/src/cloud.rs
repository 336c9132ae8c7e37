use serde_json::{Value, json};

use qlik_core::QlikConfig;

use crate::ToolError;

/// Raw outcome of one Cloud REST call: HTTP status plus parsed body.
/// Non-2xx responses are data, not transport errors.
#[derive(Debug)]
pub(crate) struct ApiCallResult {
    pub status: u16,
    pub body: Value,
}

impl ApiCallResult {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn to_value(&self) -> Value {
        json!({
            "ok": self.is_success(),
            "status": self.status,
            "body": self.body,
        })
    }
}

/// Client for the Cloud REST surface (`/api/v1`), complementing the
/// WebSocket Engine API for catalog-level reads.
pub(crate) struct CloudClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl CloudClient {
    pub fn new(config: &QlikConfig, token: String) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| {
                ToolError::new("http_client_error", format!("Failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            base_url: config.server_url.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<ApiCallResult, ToolError> {
        let path = normalize_api_path(path)?;
        let mut url = reqwest::Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ToolError::new("invalid_url", format!("Invalid API URL/path: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }

        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| {
                ToolError::new(
                    "connection_error",
                    format!("Failed to reach Qlik Cloud API at {}: {e}", self.base_url),
                )
                .with_docs_hint("Ensure QLIK_SERVER_URL points to a reachable tenant.")
            })?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| {
            ToolError::new("response_error", format!("Failed to read API response body: {e}"))
        })?;
        Ok(ApiCallResult {
            status,
            body: parse_response_body(&bytes),
        })
    }

    /// App catalog through the items listing, which carries space and
    /// ownership attributes the bare apps endpoint lacks.
    pub async fn get_apps(&self, limit: usize) -> Result<ApiCallResult, ToolError> {
        self.get(
            "/api/v1/items",
            &[
                ("resourceType".to_string(), "app".to_string()),
                ("limit".to_string(), limit.to_string()),
            ],
        )
        .await
    }

    pub async fn get_app(&self, app_id: &str) -> Result<ApiCallResult, ToolError> {
        self.get(&format!("/api/v1/apps/{app_id}"), &[]).await
    }

    pub async fn get_app_metadata(&self, app_id: &str) -> Result<ApiCallResult, ToolError> {
        self.get(&format!("/api/v1/apps/{app_id}/data/metadata"), &[])
            .await
    }

    pub async fn get_spaces(&self, limit: usize) -> Result<ApiCallResult, ToolError> {
        self.get("/api/v1/spaces", &[("limit".to_string(), limit.to_string())])
            .await
    }

    pub async fn get_data_assets(&self, limit: usize) -> Result<ApiCallResult, ToolError> {
        self.get(
            "/api/v1/data-assets",
            &[("limit".to_string(), limit.to_string())],
        )
        .await
    }
}

pub(crate) fn normalize_api_path(raw: &str) -> Result<String, ToolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ToolError::new("invalid_path", "API path must not be empty").with_field("path"));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}
