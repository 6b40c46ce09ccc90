use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use driftfs_types::{ContentId, MultipartContext};

use crate::error::StoreResult;

/// Durable destination of flushed cache data.
///
/// All implementations must satisfy these invariants:
/// - Positional writes are idempotent; replaying a write after a crash
///   leaves the same bytes.
/// - Implementations are internally thread-safe; callers do not lock.
/// - All I/O errors are propagated, never silently ignored.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fill `buf` from the object at `offset`. Returns the number of bytes
    /// read; short reads happen only at end of object.
    async fn read_at(&self, id: &ContentId, buf: &mut [u8], offset: u64) -> StoreResult<usize>;

    /// Write `data` at `offset`, extending the object if needed.
    async fn write_at(&self, id: &ContentId, data: &[u8], offset: u64) -> StoreResult<()>;

    /// Current object size in bytes.
    async fn get_size(&self, id: &ContentId) -> StoreResult<u64>;

    /// Delete the object. Deleting an absent object is not an error.
    async fn delete(&self, id: &ContentId) -> StoreResult<()>;

    /// Capability query: the streaming-multipart surface, if this backend
    /// has one. The offloader dispatches on the answer.
    fn as_incremental(&self) -> Option<&dyn IncrementalStore> {
        None
    }
}

impl fmt::Debug for dyn ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn ContentStore")
    }
}

/// Optional streaming-multipart capability of object-storage backends.
#[async_trait]
pub trait IncrementalStore: Send + Sync {
    /// Start or continue an incremental upload. Reads committed parts from
    /// the view, uploads them in parallel, and returns the bytes newly
    /// enqueued. Objects smaller than the backend's minimum part size
    /// return 0 and defer everything to [`complete_incremental_write`].
    ///
    /// [`complete_incremental_write`]: IncrementalStore::complete_incremental_write
    async fn flush_incremental(
        &self,
        id: &ContentId,
        view: Arc<dyn ContentView>,
    ) -> StoreResult<u64>;

    /// Finalize the object: a single PUT for small objects, otherwise the
    /// tail part plus a multipart-complete with the accumulated part map.
    async fn complete_incremental_write(
        &self,
        id: &ContentId,
        view: Arc<dyn ContentView>,
    ) -> StoreResult<()>;
}

/// Read access to one cache entry, handed to streaming backends during a
/// flush. The view outlives individual part uploads, so it is shared.
pub trait ContentView: Send + Sync {
    /// Logical content size.
    fn size(&self) -> u64;

    /// Read `len` bytes at `offset`. The range must lie inside
    /// `[0, size())`; the flush holder guarantees the bytes are present.
    fn read(&self, offset: u64, len: usize) -> StoreResult<Bytes>;

    /// The entry's multipart bookkeeping, shared with the backend for the
    /// duration of the upload.
    fn multipart(&self) -> Arc<Mutex<MultipartContext>>;

    /// `true` once the flush has been cancelled; backends check this
    /// between part uploads and stop without advancing state.
    fn is_cancelled(&self) -> bool;
}
