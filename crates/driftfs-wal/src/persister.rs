use driftfs_types::ContentId;

use crate::error::WalResult;
use crate::record::SliceRecord;

/// Single-writer, multi-reader persistence log for cache mutations.
///
/// All implementations must satisfy these invariants:
/// - Records appear in the log in real-time order of the append calls.
/// - `append_*` returns once the record is visible to a subsequent
///   `recover`; it never waits for disk I/O.
/// - `recover` is called before any concurrent appenders exist.
/// - `close` is idempotent; appends after `close` fail with `Closed`.
pub trait Persister: Send + Sync {
    /// Append a SLICE record.
    fn append_slice(&self, record: &SliceRecord) -> WalResult<()>;

    /// Append a REMOVE record. On replay, all SLICE records for this
    /// content id that precede the REMOVE are dropped.
    fn append_remove(&self, content_id: &ContentId) -> WalResult<()>;

    /// Start flushing dirty pages to disk without blocking on the I/O.
    fn sync(&self) -> WalResult<()>;

    /// Replay the log: the ordered stream of SLICE records whose content
    /// id has no later REMOVE.
    fn recover(&self) -> WalResult<Vec<SliceRecord>>;

    /// Flush synchronously and close the log.
    fn close(&self) -> WalResult<()>;

    /// `false` for the null backend; the cache then runs without the
    /// write-ahead guarantee.
    fn is_enabled(&self) -> bool;
}
