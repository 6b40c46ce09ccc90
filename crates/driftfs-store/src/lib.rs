//! Content store backends for the driftfs cache.
//!
//! A content store is the durable destination of flushed cache data. All
//! backends implement the [`ContentStore`] trait (positional reads and
//! writes keyed by [`ContentId`]); object-storage backends additionally
//! implement [`IncrementalStore`], the streaming-multipart capability the
//! offloader discovers through [`ContentStore::as_incremental`].
//!
//! # Backends
//!
//! - [`MemoryStore`] — `HashMap`-based store for tests and embedding
//! - [`FsStore`] — content-addressed fanout directory on a local filesystem
//! - [`RemoteStore`] — object storage driven through an [`ObjectClient`]
//!   (an S3 implementation and an in-memory implementation are provided)
//!
//! # Design Rules
//!
//! 1. Stores never interpret content; they are pure byte ranges per id.
//! 2. Positional writes are idempotent: re-flushing the same range after a
//!    crash is safe.
//! 3. The base capability is the only universally-required surface;
//!    streaming multipart is strictly optional.
//! 4. All I/O errors are propagated, never silently ignored.
//!
//! [`ContentId`]: driftfs_types::ContentId

pub mod client;
pub mod error;
pub mod fs;
pub mod memory;
pub mod remote;
pub mod s3;
pub mod traits;

pub use client::{ClientStats, MemoryObjectClient, ObjectClient};
pub use error::{StoreError, StoreResult};
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use remote::{RemoteConfig, RemoteStore};
pub use s3::{S3Client, S3Config};
pub use traits::{ContentStore, ContentView, IncrementalStore};
