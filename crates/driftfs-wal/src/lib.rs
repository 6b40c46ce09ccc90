//! Append-only write-ahead log for the driftfs content cache.
//!
//! Every cache mutation is persisted here before it becomes visible in
//! memory, so a crashed process recovers all unflushed slices on restart.
//! The log is a single growable memory-mapped file (`cache.dat`) with a
//! fixed 64-byte header followed by variable-length SLICE and REMOVE
//! records; all integers are little-endian.
//!
//! # Durability model
//!
//! Appends return once the mapped bytes are set and the header is updated;
//! actual disk commit relies on the OS page cache. [`Persister::sync`]
//! issues an asynchronous msync so dirty pages start flushing without
//! blocking the caller. Strict durability is provided by the content
//! store, not by this log.
//!
//! # Backends
//!
//! - [`MmapWal`] — the real log
//! - [`NullPersister`] — disables persistence (all operations no-ops)

pub mod error;
pub mod mmap;
pub mod null;
pub mod persister;
pub mod record;

pub use error::{WalError, WalResult};
pub use mmap::{MmapWal, WalConfig};
pub use null::NullPersister;
pub use persister::Persister;
pub use record::SliceRecord;
