use serde_json::Value;
use thiserror::Error;

/// Failure taxonomy for the Engine client.
///
/// Transport and engine failures propagate to the caller as-is; session
/// object cleanup failures never surface here — they are attached to the
/// successful result as a `cleanup_warning` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No candidate endpoint was reachable. Retryable on a fresh attempt.
    #[error("failed to connect to Engine API. Last error: {last_error}")]
    Connection { last_error: String },

    /// The connection dropped (or a call timed out) mid-session. The only
    /// recovery is to close and reconnect.
    #[error("engine connection lost: {0}")]
    ConnectionLost(String),

    /// The engine returned an error envelope. Carries the payload verbatim.
    #[error("engine API error: {}", payload_message(.payload))]
    Engine { payload: Value },

    /// A response lacked the expected shape (qReturn/qHandle/qLayout/...).
    #[error("unexpected engine response shape: {context}")]
    Structural { context: String },

    /// Bad TLS material or an unusable server URL.
    #[error("engine configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn structural(context: impl Into<String>) -> Self {
        Self::Structural {
            context: context.into(),
        }
    }

    /// The engine's own message for error envelopes, when present.
    pub fn engine_message(&self) -> Option<&str> {
        match self {
            Self::Engine { payload } => payload.get("message").and_then(Value::as_str),
            _ => None,
        }
    }

    /// True for "app already open" engine errors, which are recoverable by
    /// looking up the existing document handle.
    pub fn is_already_open(&self) -> bool {
        match self {
            Self::Engine { payload } => payload
                .to_string()
                .to_lowercase()
                .contains("already open"),
            _ => false,
        }
    }
}

impl From<qlik_core::ConfigError> for EngineError {
    fn from(err: qlik_core::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

fn payload_message(payload: &Value) -> String {
    match payload.get("message").and_then(Value::as_str) {
        Some(message) => format!("{message} ({payload})"),
        None => payload.to_string(),
    }
}
