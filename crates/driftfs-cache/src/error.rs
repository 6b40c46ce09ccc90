use driftfs_types::{CacheState, ContentId};
use driftfs_wal::WalError;
use thiserror::Error;

/// Errors from content cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry for this content id.
    #[error("content not cached: {0}")]
    NotFound(ContentId),

    /// Operation on a closed cache.
    #[error("cache is closed")]
    Closed,

    /// The write-ahead log could not grow; the cache no longer accepts
    /// writes until the operator intervenes.
    #[error("cache is read-only after a write-ahead log failure")]
    ReadOnly,

    /// The requested range is not resident and must be fetched from the
    /// content store first.
    #[error("range [{offset}, +{len}) of {content_id} is not resident")]
    Miss {
        content_id: ContentId,
        offset: u64,
        len: u64,
    },

    /// A write addressed a chunk index beyond the log's framing.
    #[error("offset {0} is beyond the addressable range")]
    OffsetOutOfRange(u64),

    /// Illegal state transition. A bug in the caller, not a runtime
    /// condition: debug builds assert, release builds reject.
    #[error("invalid cache state transition {from} -> {to}")]
    InvalidTransition { from: CacheState, to: CacheState },

    /// Write-ahead log failure.
    #[error(transparent)]
    Wal(#[from] WalError),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
