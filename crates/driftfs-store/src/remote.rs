use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use driftfs_types::ContentId;

use crate::client::ObjectClient;
use crate::error::{StoreError, StoreResult};
use crate::traits::{ContentStore, ContentView, IncrementalStore};

/// Configuration for the object-storage backend.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Minimum (and uniform) part size for multipart uploads
    /// (default: 5 MiB, the S3 minimum).
    pub part_size: u64,
    /// Concurrent part uploads across all entries (default: 8).
    pub parallel_part_uploads: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            part_size: 5 * 1024 * 1024,
            parallel_part_uploads: 8,
        }
    }
}

/// Object-storage content store with streaming multipart upload.
///
/// Objects are keyed by the content id's hex form. The base positional
/// surface is served with whole-object reads and read-modify-write puts;
/// the offloader is expected to prefer the [`IncrementalStore`] capability,
/// which uploads full-size parts as they become available and finalizes
/// with a multipart-complete (or a single PUT for small objects).
pub struct RemoteStore {
    client: Arc<dyn ObjectClient>,
    part_size: u64,
    part_pool: Arc<Semaphore>,
}

impl RemoteStore {
    pub fn new(client: Arc<dyn ObjectClient>, config: RemoteConfig) -> Self {
        Self {
            client,
            part_size: config.part_size.max(1),
            part_pool: Arc::new(Semaphore::new(config.parallel_part_uploads.max(1))),
        }
    }

    /// The uniform part size used for multipart uploads.
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    fn key(id: &ContentId) -> String {
        id.to_hex()
    }

    /// Upload every full-size part of `[0, size)` that no one owns yet.
    /// Parts go out in parallel through the part pool; completed etags are
    /// recorded in the view's multipart context as they land. Returns the
    /// bytes newly enqueued.
    async fn upload_full_parts(
        &self,
        key: &str,
        view: &Arc<dyn ContentView>,
    ) -> StoreResult<u64> {
        let size = view.size();
        let full_parts = (size / self.part_size) as u32;
        if full_parts == 0 {
            return Ok(0);
        }

        let ctx = view.multipart();
        let upload_id = {
            let guard = ctx.lock().expect("multipart lock poisoned");
            guard.upload_id.clone()
        };
        // The flush token serializes flushes per entry, so creating the
        // upload outside the context lock cannot race another creator.
        let upload_id = match upload_id {
            Some(id) => id,
            None => {
                let id = self.client.create_multipart(key).await?;
                debug!(key, upload_id = %id, "multipart upload started");
                ctx.lock().expect("multipart lock poisoned").upload_id = Some(id.clone());
                id
            }
        };

        let claimed: Vec<u32> = {
            let mut guard = ctx.lock().expect("multipart lock poisoned");
            (1..=full_parts).filter(|n| guard.claim_part(*n)).collect()
        };
        if claimed.is_empty() {
            return Ok(0);
        }

        let mut tasks = JoinSet::new();
        for part_number in claimed {
            let client = Arc::clone(&self.client);
            let pool = Arc::clone(&self.part_pool);
            let ctx = Arc::clone(&ctx);
            let view = Arc::clone(view);
            let key = key.to_string();
            let upload_id = upload_id.clone();
            let part_size = self.part_size;

            tasks.spawn(async move {
                let _permit = pool.acquire_owned().await.expect("part pool closed");
                if view.is_cancelled() {
                    ctx.lock()
                        .expect("multipart lock poisoned")
                        .release_part(part_number);
                    return Err(StoreError::Cancelled);
                }

                let offset = u64::from(part_number - 1) * part_size;
                let data = match view.read(offset, part_size as usize) {
                    Ok(data) => data,
                    Err(e) => {
                        ctx.lock()
                            .expect("multipart lock poisoned")
                            .release_part(part_number);
                        return Err(e);
                    }
                };
                let len = data.len() as u64;

                match client.upload_part(&key, &upload_id, part_number, data).await {
                    Ok(etag) => {
                        ctx.lock()
                            .expect("multipart lock poisoned")
                            .finish_part(part_number, etag);
                        Ok(len)
                    }
                    Err(e) => {
                        warn!(key, part_number, error = %e, "part upload failed");
                        ctx.lock()
                            .expect("multipart lock poisoned")
                            .release_part(part_number);
                        Err(e)
                    }
                }
            });
        }

        let mut bytes_flushed = 0u64;
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(len)) => bytes_flushed += len,
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(StoreError::Io(std::io::Error::other(e.to_string())));
                    }
                }
            }
        }

        // Parts that made it stay recorded in the context, so a retry
        // resumes instead of starting over.
        match first_err {
            Some(e) => Err(e),
            None => Ok(bytes_flushed),
        }
    }
}

#[async_trait]
impl ContentStore for RemoteStore {
    async fn read_at(&self, id: &ContentId, buf: &mut [u8], offset: u64) -> StoreResult<usize> {
        let data = self
            .client
            .get_range(&Self::key(id), offset, buf.len())
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write_at(&self, id: &ContentId, data: &[u8], offset: u64) -> StoreResult<()> {
        let key = Self::key(id);

        // Objects are immutable blobs here, so a positional write is a
        // read-modify-write of the whole object.
        let mut object = match self.client.head(&key).await {
            Ok(size) => self.client.get_range(&key, 0, size as usize).await?.to_vec(),
            Err(StoreError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let end = offset as usize + data.len();
        if object.len() < end {
            object.resize(end, 0);
        }
        object[offset as usize..end].copy_from_slice(data);

        self.client.put_object(&key, Bytes::from(object)).await
    }

    async fn get_size(&self, id: &ContentId) -> StoreResult<u64> {
        self.client.head(&Self::key(id)).await
    }

    async fn delete(&self, id: &ContentId) -> StoreResult<()> {
        self.client.delete_object(&Self::key(id)).await
    }

    fn as_incremental(&self) -> Option<&dyn IncrementalStore> {
        Some(self)
    }
}

#[async_trait]
impl IncrementalStore for RemoteStore {
    async fn flush_incremental(
        &self,
        id: &ContentId,
        view: Arc<dyn ContentView>,
    ) -> StoreResult<u64> {
        if view.size() < self.part_size {
            // Too small for a part; the whole object goes out in one PUT
            // at complete time.
            return Ok(0);
        }
        let bytes = self.upload_full_parts(&Self::key(id), &view).await?;
        debug!(id = %id, bytes, "incremental flush");
        Ok(bytes)
    }

    async fn complete_incremental_write(
        &self,
        id: &ContentId,
        view: Arc<dyn ContentView>,
    ) -> StoreResult<()> {
        let key = Self::key(id);
        let size = view.size();
        let ctx = view.multipart();

        let has_upload = ctx
            .lock()
            .expect("multipart lock poisoned")
            .upload_id
            .is_some();

        if !has_upload && size < self.part_size {
            // Small object: one PUT, no multipart machinery.
            let data = if size == 0 {
                Bytes::new()
            } else {
                view.read(0, size as usize)?
            };
            self.client.put_object(&key, data).await?;
            debug!(id = %id, size, "small object finalized with single put");
            return Ok(());
        }

        // Catch up on any full part nobody uploaded yet.
        self.upload_full_parts(&key, &view).await?;

        let full_parts = (size / self.part_size) as u32;
        let tail_len = size - u64::from(full_parts) * self.part_size;
        let upload_id = ctx
            .lock()
            .expect("multipart lock poisoned")
            .upload_id
            .clone()
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::other("multipart context lost its upload id"))
            })?;

        if tail_len > 0 {
            let part_number = full_parts + 1;
            let claimed = ctx
                .lock()
                .expect("multipart lock poisoned")
                .claim_part(part_number);
            if claimed {
                if view.is_cancelled() {
                    ctx.lock()
                        .expect("multipart lock poisoned")
                        .release_part(part_number);
                    return Err(StoreError::Cancelled);
                }
                let offset = u64::from(full_parts) * self.part_size;
                let data = match view.read(offset, tail_len as usize) {
                    Ok(data) => data,
                    Err(e) => {
                        ctx.lock()
                            .expect("multipart lock poisoned")
                            .release_part(part_number);
                        return Err(e);
                    }
                };
                match self
                    .client
                    .upload_part(&key, &upload_id, part_number, data)
                    .await
                {
                    Ok(etag) => ctx
                        .lock()
                        .expect("multipart lock poisoned")
                        .finish_part(part_number, etag),
                    Err(e) => {
                        ctx.lock()
                            .expect("multipart lock poisoned")
                            .release_part(part_number);
                        return Err(e);
                    }
                }
            }
        }

        if view.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let parts: Vec<(u32, String)> = ctx
            .lock()
            .expect("multipart lock poisoned")
            .completed_parts()
            .map(|(n, etag)| (n, etag.to_string()))
            .collect();

        self.client.complete_multipart(&key, &upload_id, &parts).await?;
        ctx.lock().expect("multipart lock poisoned").clear();
        debug!(id = %id, parts = parts.len(), size, "multipart upload finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryObjectClient;
    use driftfs_types::MultipartContext;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const PART: u64 = 5 * 1024 * 1024;

    struct TestView {
        data: Vec<u8>,
        ctx: Arc<Mutex<MultipartContext>>,
        cancelled: AtomicBool,
    }

    impl TestView {
        fn new(data: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                data,
                ctx: Arc::new(Mutex::new(MultipartContext::new())),
                cancelled: AtomicBool::new(false),
            })
        }
    }

    impl ContentView for TestView {
        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn read(&self, offset: u64, len: usize) -> StoreResult<Bytes> {
            let offset = offset as usize;
            let end = (offset + len).min(self.data.len());
            Ok(Bytes::copy_from_slice(&self.data[offset..end]))
        }

        fn multipart(&self) -> Arc<Mutex<MultipartContext>> {
            Arc::clone(&self.ctx)
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::Relaxed)
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn store() -> (Arc<MemoryObjectClient>, RemoteStore) {
        let client = Arc::new(MemoryObjectClient::new());
        let store = RemoteStore::new(
            Arc::clone(&client) as Arc<dyn ObjectClient>,
            RemoteConfig::default(),
        );
        (client, store)
    }

    fn cid(name: &[u8]) -> ContentId {
        ContentId::from_bytes(name).unwrap()
    }

    #[tokio::test]
    async fn small_object_defers_to_single_put() {
        let (client, store) = store();
        let id = cid(b"small");
        let view = TestView::new(pattern(1024));

        let flushed = store
            .flush_incremental(&id, view.clone() as Arc<dyn ContentView>)
            .await
            .unwrap();
        assert_eq!(flushed, 0);

        store
            .complete_incremental_write(&id, view as Arc<dyn ContentView>)
            .await
            .unwrap();

        let stats = client.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.multipart_creates, 0);
        assert_eq!(client.object(&id.to_hex()).unwrap(), pattern(1024));
    }

    #[tokio::test]
    async fn two_full_parts_then_complete() {
        let (client, store) = store();
        let id = cid(b"big");
        let data = pattern(2 * PART as usize);
        let view = TestView::new(data.clone());

        let flushed = store
            .flush_incremental(&id, view.clone() as Arc<dyn ContentView>)
            .await
            .unwrap();
        assert_eq!(flushed, 2 * PART);
        assert_eq!(client.stats().parts_uploaded, 2);

        // Not visible until completed.
        assert!(client.object(&id.to_hex()).is_none());

        store
            .complete_incremental_write(&id, view as Arc<dyn ContentView>)
            .await
            .unwrap();

        assert_eq!(client.stats().completes, 1);
        assert_eq!(client.object(&id.to_hex()).unwrap(), data);
        assert_eq!(client.open_uploads(), 0);
    }

    #[tokio::test]
    async fn tail_part_is_uploaded_at_complete() {
        let (client, store) = store();
        let id = cid(b"tailed");
        let data = pattern(PART as usize + 100);
        let view = TestView::new(data.clone());

        let flushed = store
            .flush_incremental(&id, view.clone() as Arc<dyn ContentView>)
            .await
            .unwrap();
        assert_eq!(flushed, PART);

        store
            .complete_incremental_write(&id, view as Arc<dyn ContentView>)
            .await
            .unwrap();

        assert_eq!(client.stats().parts_uploaded, 2);
        assert_eq!(client.object(&id.to_hex()).unwrap(), data);
    }

    #[tokio::test]
    async fn second_flush_enqueues_nothing_new() {
        let (_client, store) = store();
        let id = cid(b"idem");
        let view = TestView::new(pattern(2 * PART as usize));

        let first = store
            .flush_incremental(&id, view.clone() as Arc<dyn ContentView>)
            .await
            .unwrap();
        let second = store
            .flush_incremental(&id, view as Arc<dyn ContentView>)
            .await
            .unwrap();
        assert_eq!(first, 2 * PART);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn cancellation_uploads_no_parts() {
        let (client, store) = store();
        let id = cid(b"cancel");
        let view = TestView::new(pattern(2 * PART as usize));
        view.cancelled.store(true, Ordering::Relaxed);

        let err = store
            .flush_incremental(&id, view.clone() as Arc<dyn ContentView>)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(client.stats().parts_uploaded, 0);

        // Claims were released; nothing is stuck in the uploading set.
        let ctx = view.multipart();
        let guard = ctx.lock().unwrap();
        assert!(!guard.is_uploading(1));
        assert!(!guard.is_uploading(2));
    }

    #[tokio::test]
    async fn positional_write_via_base_capability() {
        let (client, store) = store();
        let id = cid(b"rmw");

        store.write_at(&id, b"hellohello", 0).await.unwrap();
        store.write_at(&id, b"WORLD", 5).await.unwrap();

        assert_eq!(client.object(&id.to_hex()).unwrap(), b"helloWORLD");
        assert_eq!(store.get_size(&id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn capability_query_reports_incremental() {
        let (_client, store) = store();
        assert!(store.as_incremental().is_some());
    }
}
