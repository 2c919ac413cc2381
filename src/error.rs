use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error codes surfaced to callers and event listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// File rejected before any network call
    ValidationError,
    /// Server answered with a non-2xx status or `success: false`
    ServerError,
    /// Transport-level failure (connection, timeout, DNS)
    NetworkError,
    /// Server refused to resume; a fresh session is needed
    SessionExpired,
    /// Upload was cancelled by the caller
    UploadCancelled,
    /// Upload attempt stopped because the session was paused
    UploadPaused,
    /// No session with the given id is tracked
    SessionNotFound,
    /// Operation not allowed in the session's current status
    InvalidState,
    /// Durable session store failure
    StorageError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::UploadCancelled => "UPLOAD_CANCELLED",
            ErrorCode::UploadPaused => "UPLOAD_PAUSED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::StorageError => "STORAGE_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload failure carried back to callers and published on `session:failed`
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct UploadError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl UploadError {
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
            session_id: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message, false)
    }

    /// Server errors are recoverable only for 5xx statuses
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message, status >= 500)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message, true)
    }

    pub fn session_expired(session_id: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SessionExpired, message, false).with_session(session_id)
    }

    pub fn cancelled(session_id: &str) -> Self {
        Self::new(ErrorCode::UploadCancelled, "Upload was cancelled", false)
            .with_session(session_id)
    }

    pub fn paused(session_id: &str) -> Self {
        Self::new(ErrorCode::UploadPaused, "Upload is paused", true).with_session(session_id)
    }

    pub fn not_found(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("Unknown upload session: {}", session_id),
            false,
        )
        .with_session(session_id)
    }

    pub fn invalid_state(session_id: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message, false).with_session(session_id)
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::UploadCancelled
    }
}

/// Durable session store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        UploadError::new(ErrorCode::StorageError, err.to_string(), false)
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not find home directory")]
    NoHomeDir,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UploadError::validation("File too large");
        assert_eq!(err.to_string(), "VALIDATION_ERROR: File too large");
        assert!(!err.recoverable);
    }

    #[test]
    fn test_server_error_recoverability() {
        assert!(UploadError::server(503, "unavailable").recoverable);
        assert!(UploadError::server(500, "boom").recoverable);
        assert!(!UploadError::server(400, "bad request").recoverable);
        assert!(!UploadError::server(200, "success false").recoverable);
    }

    #[test]
    fn test_error_code_serialization() {
        let err = UploadError::session_expired("s-1", "gone");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "SESSION_EXPIRED");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["recoverable"], false);
    }

    #[test]
    fn test_store_error_conversion() {
        let err: UploadError = StoreError::LockPoisoned("sessions".to_string()).into();
        assert_eq!(err.code, ErrorCode::StorageError);
        assert!(err.message.contains("Lock poisoned"));
    }
}
