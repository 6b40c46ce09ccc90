//! Background offloader for the driftfs content cache.
//!
//! The offloader asynchronously drains `Pending` cache entries to the
//! content store and populates the cache on read miss (with sequential
//! prefetch). It dispatches on backend capability: stores with only the
//! positional surface get suffix flushes against the durable watermark;
//! streaming-multipart stores get incremental part uploads with a final
//! complete.
//!
//! [`Offloader::flush_and_finalize`] is the synchronous durability
//! primitive protocol handlers call when a client demands durability
//! (SMB CLOSE, NFS COMMIT). [`Recovery`] replays the write-ahead log into
//! the cache at startup, before the server accepts traffic.

pub mod error;
pub mod offloader;
pub mod recovery;
pub mod view;

pub use error::{OffloadError, OffloadResult};
pub use offloader::{FlushOutcome, OffloadConfig, Offloader};
pub use recovery::{Recovery, RecoveryReport};
pub use view::CacheContentView;
