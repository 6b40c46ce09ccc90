//! High-level embedding API for the driftfs content cache.
//!
//! Protocol front-ends (NFS, SMB) construct one [`Driftfs`] per server:
//! it wires the write-ahead log, the in-memory cache, the configured
//! content store, and the background offloader together, replays the log
//! before any traffic is accepted, and exposes the cache control surface
//! (`write_at`, `read_at`, `size`, `flush_and_finalize`, `remove`).

pub mod config;
pub mod engine;
pub mod error;

pub use config::{CacheSection, Config, OffloaderSection, StoreSection};
pub use engine::Driftfs;
pub use error::{SdkError, SdkResult};

// Re-export key types
pub use driftfs_cache::CacheStats;
pub use driftfs_offload::{FlushOutcome, RecoveryReport};
pub use driftfs_types::{CacheState, ContentId};
