use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;

use driftfs_cache::{ContentCache, EntryHandle};
use driftfs_store::{ContentView, StoreError, StoreResult};
use driftfs_types::{ContentId, MultipartContext};

/// [`ContentView`] over one cache entry, handed to streaming backends for
/// the duration of a flush.
///
/// The flush holder has made the entry resident before constructing the
/// view, so reads inside `[0, size())` never miss; a miss here means the
/// entry was mutated out from under an unlocked flush and is reported as
/// an I/O error.
pub struct CacheContentView {
    cache: Arc<ContentCache>,
    id: ContentId,
    handle: Arc<EntryHandle>,
    shutdown: watch::Receiver<bool>,
}

impl CacheContentView {
    pub fn new(
        cache: Arc<ContentCache>,
        id: ContentId,
        handle: Arc<EntryHandle>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            id,
            handle,
            shutdown,
        })
    }
}

impl ContentView for CacheContentView {
    fn size(&self) -> u64 {
        self.cache.size(&self.id).unwrap_or(0)
    }

    fn read(&self, offset: u64, len: usize) -> StoreResult<Bytes> {
        let mut buf = vec![0u8; len];
        let n = self
            .cache
            .read_at(&self.id, &mut buf, offset)
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn multipart(&self) -> Arc<Mutex<MultipartContext>> {
        self.handle.multipart()
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }
}
