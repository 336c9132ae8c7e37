use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Credentials persisted by `qlik login` and consumed by the MCP runtime
/// when no `QLIK_API_KEY` is present.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub server_url: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

impl StoredCredentials {
    /// True when the token expires within the given buffer and should be
    /// refreshed before use.
    pub fn expires_within(&self, buffer: chrono::Duration) -> bool {
        Utc::now() + buffer >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_buffer_is_applied() {
        let creds = StoredCredentials {
            server_url: "https://tenant.qlikcloud.com".to_string(),
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: Utc::now() + chrono::Duration::minutes(3),
        };
        assert!(creds.expires_within(chrono::Duration::minutes(5)));
        assert!(!creds.expires_within(chrono::Duration::minutes(1)));
    }
}
