//! In-memory write-back content cache for driftfs.
//!
//! The cache owns per-content-id entries, brokers all reads and writes,
//! and keeps the write-ahead log consistent with memory: every mutation is
//! appended to the log before it becomes visible. Reads serve the latest
//! byte value at every position across overlapping slices; bytes no slice
//! covers are zeros inside the written range.
//!
//! Entries move through a strict lifecycle (`Pending` → `Uploading` →
//! `Cached` → `Finalized`, with writes pulling any state back to
//! `Pending`); the offloader drains `Pending` entries to the content store
//! and the cache evicts clean entries under capacity pressure.
//!
//! Concurrency: operations on the same content id serialize on a per-entry
//! mutex; operations on different ids run in parallel. The per-entry flush
//! token (an async mutex) additionally guarantees at most one flush cycle
//! per entry at any instant.

pub mod cache;
pub mod entry;
pub mod error;

pub use cache::{CacheConfig, CacheStats, ContentCache, FlushWindow};
pub use entry::{EntryHandle, Slice};
pub use error::{CacheError, CacheResult};
