use std::collections::BTreeMap;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the session and message synchronization layer.
///
/// Cloneable so that one refresh outcome can be handed to every request
/// waiting on it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Server unreachable, connection reset or request timeout
    #[error("network error: {0}")]
    Network(String),

    /// Invalid credentials or a rejected/expired refresh token
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Server-rejected registration (or other input) fields
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },

    /// Push channel handshake or protocol failure
    #[error("push connection error: {0}")]
    Connection(String),

    /// Push send attempted while the channel is not connected
    #[error("push channel is not connected")]
    NotConnected,

    /// Any other non-2xx response
    #[error("request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("session storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    /// True when the caller must treat the client as logged out.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Connection(err.to_string())
    }
}

/// Pull a human readable message out of an error body.
///
/// The backend answers with `{"message": ...}` for most failures, Spring's
/// default handler uses `error`, and some proxies return plain text.
pub fn server_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => ["message", "error", "detail"]
            .iter()
            .filter_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty()),
        Ok(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Ok(_) => None,
        Err(_) => Some(trimmed.to_string()),
    }
}

/// Field errors reported by the server on a rejected form, if any.
pub fn field_errors(body: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) else {
        return fields;
    };

    for key in ["errors", "fieldErrors"] {
        if let Some(serde_json::Value::Object(errors)) = map.get(key) {
            for (field, value) in errors {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                fields.insert(field.clone(), text);
            }
        }
    }

    fields
}
