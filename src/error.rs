use rusqlite::ffi::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupportDeskError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid ticket transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture device already in use")]
    CaptureBusy,

    #[error("Storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SupportDeskError>;

impl SupportDeskError {
    pub fn not_found(kind: impl ToString, id: impl Into<String>) -> Self {
        SupportDeskError::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// Whether the sync queue should retry the operation that produced this error.
    ///
    /// Only transport-level failures are retryable. Everything else is either a
    /// caller mistake or a local condition that retrying cannot fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SupportDeskError::NetworkFailure(_) | SupportDeskError::Timeout(_)
        )
    }

    /// Short machine-readable code, stable across message wording changes.
    pub fn code(&self) -> &'static str {
        match self {
            SupportDeskError::NotFound { .. } => "not_found",
            SupportDeskError::InvariantViolation(_) => "invariant_violation",
            SupportDeskError::InvalidTransition { .. } => "invalid_transition",
            SupportDeskError::InvalidQuery(_) => "invalid_query",
            SupportDeskError::NetworkFailure(_) => "network_failure",
            SupportDeskError::Timeout(_) => "timeout",
            SupportDeskError::PermissionDenied(_) => "permission_denied",
            SupportDeskError::CaptureBusy => "capture_busy",
            SupportDeskError::StorageQuotaExceeded(_) => "storage_quota_exceeded",
            SupportDeskError::Storage(_) => "storage_error",
            SupportDeskError::Json(_) => "json_error",
            SupportDeskError::Io(_) => "io_error",
            SupportDeskError::Config(_) => "config_error",
        }
    }
}

impl From<rusqlite::Error> for SupportDeskError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::DiskFull => {
                SupportDeskError::StorageQuotaExceeded(e.to_string())
            }
            _ => SupportDeskError::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for SupportDeskError {
    fn from(e: serde_json::Error) -> Self {
        SupportDeskError::Json(e.to_string())
    }
}

impl From<std::io::Error> for SupportDeskError {
    fn from(e: std::io::Error) -> Self {
        SupportDeskError::Io(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SupportDeskError {
    fn from(e: tokio::task::JoinError) -> Self {
        SupportDeskError::Storage(format!("store task failed: {}", e))
    }
}
