use thiserror::Error;

/// Errors from content store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object stored under this key.
    #[error("content not found: {key}")]
    NotFound { key: String },

    /// The backend rejected the caller's credentials or ACL.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The backend is temporarily unreachable or throttling. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The operation observed a cancellation signal and stopped early.
    /// No state was advanced.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic I/O error from the backend or OS.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Errors the offloader retries with backoff rather than surfacing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
