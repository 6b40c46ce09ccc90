use driftfs_cache::CacheError;
use driftfs_store::StoreError;
use driftfs_wal::WalError;
use thiserror::Error;

/// Errors from offloader operations.
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wal(#[from] WalError),

    /// A shutdown signal stopped the operation; no state was advanced.
    #[error("operation cancelled")]
    Cancelled,
}

impl OffloadError {
    /// Whether this error is a cancellation, from either the offloader's
    /// own checks or a streaming backend observing the view's signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            OffloadError::Cancelled | OffloadError::Store(StoreError::Cancelled)
        )
    }
}

/// Result alias for offloader operations.
pub type OffloadResult<T> = Result<T, OffloadError>;
