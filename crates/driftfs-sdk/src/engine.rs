use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use driftfs_cache::{CacheError, CacheStats, ContentCache};
use driftfs_offload::{FlushOutcome, Offloader, Recovery, RecoveryReport};
use driftfs_store::{
    ContentStore, FsStore, MemoryStore, RemoteConfig, RemoteStore, S3Client, S3Config, StoreError,
};
use driftfs_types::ContentId;
use driftfs_wal::{MmapWal, NullPersister, Persister, WalConfig};

use crate::config::{Config, StoreSection};
use crate::error::{SdkError, SdkResult};

/// One driftfs instance: write-ahead log, content cache, content store,
/// and background offloader, wired together.
///
/// Construction replays the log before the background loop starts, so an
/// embedding server can open its listen sockets only after `open`
/// returns. [`close`] drains dirty entries and shuts everything down.
///
/// [`close`]: Driftfs::close
pub struct Driftfs {
    cache: Arc<ContentCache>,
    store: Arc<dyn ContentStore>,
    offloader: Arc<Offloader>,
    recovery: RecoveryReport,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Driftfs {
    /// Open an instance from configuration, building the configured
    /// content store backend.
    pub async fn open(config: Config) -> SdkResult<Self> {
        let store = build_store(&config.store).await?;
        Self::open_with_store(config, store).await
    }

    /// Open an instance against a caller-supplied content store. This is
    /// the embedding (and testing) entry point for stores the
    /// configuration cannot describe.
    pub async fn open_with_store(
        config: Config,
        store: Arc<dyn ContentStore>,
    ) -> SdkResult<Self> {
        let persister: Arc<dyn Persister> = match &config.cache.path {
            Some(dir) => Arc::new(MmapWal::open(dir, WalConfig::default())?),
            None => {
                warn!("no cache path configured; running without crash recovery");
                Arc::new(NullPersister::new())
            }
        };

        let cache = Arc::new(ContentCache::new(
            Arc::clone(&persister),
            config.cache.to_cache_config(),
        ));

        let recovery = Recovery::new(persister, Arc::clone(&cache)).run()?;

        let offloader = Offloader::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            config.offloader.to_offload_config(),
        );
        let worker = tokio::spawn(Arc::clone(&offloader).run());

        info!(
            recovered_entries = recovery.entries,
            recovered_bytes = recovery.bytes,
            "driftfs open"
        );
        Ok(Self {
            cache,
            store,
            offloader,
            recovery,
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    /// What the log replay brought back at open time.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// The underlying cache, for protocol handlers that need direct
    /// access (state inspection, capacity stats).
    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// The configured content store.
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ---- cache control surface ----

    /// Buffer a write; it is durable in the write-ahead log when this
    /// returns and reaches the content store asynchronously.
    pub fn write_at(&self, id: &ContentId, data: &[u8], offset: u64) -> SdkResult<()> {
        self.cache.write_at(id, data, offset)?;
        Ok(())
    }

    /// Read through the cache, fetching absent ranges from the content
    /// store with sequential prefetch.
    pub async fn read_at(
        &self,
        id: &ContentId,
        buf: &mut [u8],
        offset: u64,
    ) -> SdkResult<usize> {
        Ok(self.offloader.read_at(id, buf, offset).await?)
    }

    /// Logical content size: the cache's view if resident, the store's
    /// otherwise.
    pub async fn size(&self, id: &ContentId) -> SdkResult<u64> {
        match self.cache.size(id) {
            Ok(size) => Ok(size),
            Err(CacheError::NotFound(_)) => Ok(self.store.get_size(id).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Synchronous durability: force the entry to the content store and
    /// finalize it. Protocol handlers call this on SMB CLOSE / NFS
    /// COMMIT and must not acknowledge unsafe writes if it fails.
    pub async fn flush_and_finalize(&self, id: &ContentId) -> SdkResult<FlushOutcome> {
        Ok(self.offloader.flush_and_finalize(id).await?)
    }

    /// Remove the content everywhere: the log (REMOVE record), the
    /// cache, and the content store.
    pub async fn remove(&self, id: &ContentId) -> SdkResult<()> {
        self.cache.remove(id)?;
        match self.store.delete(id).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drain dirty entries to the store, stop the background loop, and
    /// close the log. Idempotent.
    pub async fn close(&self) -> SdkResult<()> {
        let worker = self.worker.lock().expect("worker lock poisoned").take();
        let Some(worker) = worker else {
            return Ok(());
        };

        self.offloader.drain().await?;
        self.offloader.shutdown();
        if let Err(e) = worker.await {
            warn!(error = %e, "offloader worker ended abnormally");
        }
        self.cache.close()?;
        info!("driftfs closed");
        Ok(())
    }
}

async fn build_store(section: &StoreSection) -> SdkResult<Arc<dyn ContentStore>> {
    match section {
        StoreSection::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreSection::Filesystem { path } => Ok(Arc::new(FsStore::new(path.clone()))),
        StoreSection::ObjectStore {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            part_size,
        } => {
            if bucket.is_empty() {
                return Err(SdkError::Config("object store bucket is empty".into()));
            }
            let client = S3Client::connect(S3Config {
                bucket: bucket.clone(),
                region: region.clone(),
                endpoint: endpoint.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                force_path_style: endpoint.is_some(),
            })
            .await?;
            Ok(Arc::new(RemoteStore::new(
                Arc::new(client),
                RemoteConfig {
                    part_size: *part_size,
                    ..RemoteConfig::default()
                },
            )))
        }
    }
}
