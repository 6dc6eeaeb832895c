use supportdesk::SupportDeskError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("no remote configured")]
    NotConfigured,

    #[error("cannot set up remote client: {0}")]
    Client(String),
}

impl RemoteError {
    /// The request never got an answer; the remote may be unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport { .. } | RemoteError::Timeout(_))
    }

    /// Whether sending the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport { .. } | RemoteError::Timeout(_) => true,
            RemoteError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            RemoteError::Decode(_) | RemoteError::NotConfigured | RemoteError::Client(_) => false,
        }
    }
}

/// Why a sync pass stopped early.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("local store failed: {0}")]
    Store(#[from] SupportDeskError),
}

impl SyncError {
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_transport())
    }
}

impl From<RemoteError> for SupportDeskError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Timeout(ms) => SupportDeskError::Timeout(ms),
            RemoteError::Status { status, body } if status == 401 || status == 403 => {
                SupportDeskError::PermissionDenied(format!("remote returned {}: {}", status, body))
            }
            RemoteError::Decode(msg) => SupportDeskError::Json(msg),
            RemoteError::NotConfigured => SupportDeskError::Config("no remote configured".to_string()),
            RemoteError::Client(msg) => SupportDeskError::Config(msg),
            other => SupportDeskError::NetworkFailure(other.to_string()),
        }
    }
}
