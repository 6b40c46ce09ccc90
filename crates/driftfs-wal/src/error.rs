use thiserror::Error;

/// Errors from write-ahead log operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Operation on a closed log.
    #[error("write-ahead log is closed")]
    Closed,

    /// The log structure is invalid. Fatal at startup.
    #[error("write-ahead log corrupted at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    /// The on-disk version differs from this build. Fatal at startup.
    #[error("write-ahead log version {found} unsupported (expected {expected})")]
    VersionMismatch { found: u16, expected: u16 },

    /// Growing the log failed (typically out of disk space). Fatal for
    /// writes; the cache goes read-only.
    #[error("write-ahead log cannot grow: {0}")]
    WalFull(String),

    /// A record field does not fit its wire framing.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// I/O error from the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for log operations.
pub type WalResult<T> = Result<T, WalError>;
