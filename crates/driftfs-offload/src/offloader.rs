use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use driftfs_cache::{CacheError, ContentCache};
use driftfs_store::{ContentStore, ContentView, IncrementalStore, StoreError};
use driftfs_types::{CacheState, ContentId};

use crate::error::{OffloadError, OffloadResult};
use crate::view::CacheContentView;

/// Configuration for the offloader.
#[derive(Clone, Debug)]
pub struct OffloadConfig {
    /// Worker budget for flushes (default: 16).
    pub parallel_uploads: usize,
    /// Worker budget for read-miss fetches (default: 4).
    pub parallel_downloads: usize,
    /// Chunks to prefetch past a read miss (default: 4).
    pub prefetch_blocks: u32,
    /// Idleness threshold before a `Pending` entry is flushed in the
    /// background (default: 3 s).
    pub flush_timeout: Duration,
    /// Background scan period (default: 500 ms).
    pub scan_interval: Duration,
    /// Deferral applied by `flush_and_finalize` when a write landed inside
    /// the active window, to gather successive writes (default: 10 ms).
    pub gather_delay: Duration,
    /// How fresh the last write must be for the gather deferral to apply
    /// (default: 10 ms).
    pub active_window: Duration,
    /// First retry delay after a transient store failure (default: 500 ms).
    pub retry_backoff: Duration,
    /// Retry delay ceiling (default: 30 s).
    pub retry_backoff_cap: Duration,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            parallel_uploads: 16,
            parallel_downloads: 4,
            prefetch_blocks: 4,
            flush_timeout: Duration::from_secs(3),
            scan_interval: Duration::from_millis(500),
            gather_delay: Duration::from_millis(10),
            active_window: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(500),
            retry_backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Result of a synchronous flush-and-finalize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Bytes written (or newly enqueued as multipart parts) by this call.
    pub bytes_flushed: u64,
    /// Whether the streaming-multipart path was taken.
    pub incremental: bool,
    /// The entry had nothing left to flush; the call was a no-op.
    pub already_flushed: bool,
}

fn wall_nanos() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Background workers that drain dirty cache entries into the content
/// store and populate the cache on read miss.
///
/// The offloader holds the cache; the cache never calls back into the
/// offloader.
pub struct Offloader {
    cache: Arc<ContentCache>,
    store: Arc<dyn ContentStore>,
    config: OffloadConfig,
    uploads: Arc<Semaphore>,
    downloads: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Offloader {
    pub fn new(
        cache: Arc<ContentCache>,
        store: Arc<dyn ContentStore>,
        config: OffloadConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            uploads: Arc::new(Semaphore::new(config.parallel_uploads.max(1))),
            downloads: Arc::new(Semaphore::new(config.parallel_downloads.max(1))),
            cache,
            store,
            config,
            shutdown,
        })
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Signal every loop and in-flight flush to stop at its next
    /// cancellation point.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Background loop: every scan interval, dispatch idle `Pending`
    /// entries to the upload pool, finalize idle streaming uploads, and
    /// nudge the log toward disk. Runs until [`shutdown`] is called.
    ///
    /// [`shutdown`]: Offloader::shutdown
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stop = self.shutdown.subscribe();

        info!(
            parallel_uploads = self.config.parallel_uploads,
            parallel_downloads = self.config.parallel_downloads,
            flush_timeout_ms = self.config.flush_timeout.as_millis() as u64,
            "offloader started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => Self::scan_once(&self),
                _ = stop.changed() => break,
            }
        }
        info!("offloader stopped");
    }

    fn scan_once(this: &Arc<Self>) {
        for id in this.cache.flush_candidates(this.config.flush_timeout) {
            let Ok(permit) = Arc::clone(&this.uploads).try_acquire_owned() else {
                break;
            };
            let worker = Arc::clone(this);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.background_flush(&id).await {
                    if !e.is_cancelled() {
                        warn!(id = %id, error = %e, "background flush failed");
                    }
                }
            });
        }

        if this.store.as_incremental().is_some() {
            for id in this.cache.finalize_candidates(this.config.flush_timeout) {
                let Ok(permit) = Arc::clone(&this.uploads).try_acquire_owned() else {
                    break;
                };
                let worker = Arc::clone(this);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = worker.background_finalize(&id).await {
                        if !e.is_cancelled() {
                            warn!(id = %id, error = %e, "background finalize failed");
                        }
                    }
                });
            }
        }

        match this.cache.sync_wal() {
            Ok(()) | Err(CacheError::Closed) => {}
            Err(e) => warn!(error = %e, "WAL sync failed"),
        }
    }

    /// One background flush pass over an entry, skipping entries another
    /// worker already owns.
    async fn background_flush(&self, id: &ContentId) -> OffloadResult<()> {
        let handle = match self.cache.entry(id) {
            Ok(handle) => handle,
            Err(CacheError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let token = handle.flush_token();
        let Ok(_guard) = token.try_lock_owned() else {
            // Another worker holds the single-writer token; it will do the
            // work.
            return Ok(());
        };

        let outcome = match self.store.as_incremental() {
            Some(incremental) => self.flush_streaming_locked(id, incremental).await?,
            None => self.flush_positional_locked(id).await?,
        };
        if !outcome.already_flushed {
            debug!(id = %id, bytes = outcome.bytes_flushed, "background flush");
        }
        Ok(())
    }

    /// Background finalize for a streaming entry idle in `Uploading`.
    async fn background_finalize(&self, id: &ContentId) -> OffloadResult<()> {
        let Some(incremental) = self.store.as_incremental() else {
            return Ok(());
        };
        let handle = match self.cache.entry(id) {
            Ok(handle) => handle,
            Err(CacheError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let token = handle.flush_token();
        let Ok(_guard) = token.try_lock_owned() else {
            return Ok(());
        };
        // A write may have raced the candidate scan.
        if self.cache.state(id)? != CacheState::Uploading {
            return Ok(());
        }
        self.finalize_streaming_locked(id, incremental).await
    }

    // ---- synchronous durability (flush coordinator) ----

    /// Force the entry out to the store and finalize it, for protocol
    /// handlers that must not acknowledge a write before it is durable.
    ///
    /// Idempotent: with no intervening write the second call returns
    /// `already_flushed = true` and does nothing. An unknown content id is
    /// also `already_flushed` (a COMMIT against an evicted-but-durable
    /// file is not an error).
    pub async fn flush_and_finalize(&self, id: &ContentId) -> OffloadResult<FlushOutcome> {
        let incremental = self.store.as_incremental().is_some();
        let handle = match self.cache.entry(id) {
            Ok(handle) => handle,
            Err(CacheError::NotFound(_)) => {
                return Ok(FlushOutcome {
                    bytes_flushed: 0,
                    incremental,
                    already_flushed: true,
                })
            }
            Err(e) => return Err(e.into()),
        };

        // Write-gathering: a chatty client mid-burst gets one short
        // deferral so successive writes aggregate into one flush.
        if let Ok(age) = self.cache.dirty_age(id) {
            if age < self.config.active_window {
                tokio::time::sleep(self.config.gather_delay).await;
            }
        }

        let token = handle.flush_token();
        let _guard = token.lock_owned().await;

        match self.store.as_incremental() {
            Some(incr) => {
                let dirty = self.cache.has_dirty_slices(id).unwrap_or(false);
                if !dirty && !handle.has_multipart_state() {
                    return Ok(FlushOutcome {
                        bytes_flushed: 0,
                        incremental: true,
                        already_flushed: true,
                    });
                }
                let outcome = self.flush_streaming_locked(id, incr).await?;
                self.finalize_streaming_locked(id, incr).await?;
                Ok(FlushOutcome {
                    already_flushed: false,
                    ..outcome
                })
            }
            None => self.flush_positional_locked(id).await,
        }
    }

    // ---- flush paths (flush token held) ----

    /// Suffix flush against a WriteAt-only backend.
    async fn flush_positional_locked(&self, id: &ContentId) -> OffloadResult<FlushOutcome> {
        let Some(window) = self.cache.flush_window(id)? else {
            return Ok(FlushOutcome {
                bytes_flushed: 0,
                incremental: false,
                already_flushed: true,
            });
        };

        self.cache
            .transition_if(id, CacheState::Pending, CacheState::Uploading)?;

        if let Err(e) = self.ensure_resident(id, window.start, window.len).await {
            self.revert_uploading(id);
            return Err(e);
        }

        let mut buf = vec![0u8; window.len as usize];
        let n = match self.cache.read_at(id, &mut buf, window.start) {
            Ok(n) => n,
            Err(e) => {
                self.revert_uploading(id);
                return Err(e.into());
            }
        };

        // Cancellation point between the read and write phases.
        if self.is_shutdown() {
            self.revert_uploading(id);
            return Err(OffloadError::Cancelled);
        }

        match self.store.write_at(id, &buf[..n], window.start).await {
            Ok(()) => {
                self.cache
                    .mark_flushed(id, window.start + n as u64, window.computed_at)?;
                self.cache.clear_retry_backoff(id);
                self.cache
                    .transition_if(id, CacheState::Uploading, CacheState::Cached)?;
                Ok(FlushOutcome {
                    bytes_flushed: n as u64,
                    incremental: false,
                    already_flushed: false,
                })
            }
            Err(e) => {
                self.revert_uploading(id);
                if e.is_retryable() {
                    self.cache.set_retry_backoff(
                        id,
                        self.config.retry_backoff,
                        self.config.retry_backoff_cap,
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Incremental part upload against a streaming backend. The entry
    /// stays `Uploading` until a finalize completes the object.
    async fn flush_streaming_locked(
        &self,
        id: &ContentId,
        incremental: &dyn IncrementalStore,
    ) -> OffloadResult<FlushOutcome> {
        self.ensure_resident_all(id).await?;
        self.cache
            .transition_if(id, CacheState::Pending, CacheState::Uploading)?;

        let view = self.view(id)?;
        match incremental.flush_incremental(id, view).await {
            Ok(bytes_flushed) => {
                self.cache.clear_retry_backoff(id);
                Ok(FlushOutcome {
                    bytes_flushed,
                    incremental: true,
                    already_flushed: false,
                })
            }
            Err(StoreError::Cancelled) => {
                self.revert_uploading(id);
                Err(OffloadError::Cancelled)
            }
            Err(e) => {
                self.revert_uploading(id);
                if e.is_retryable() {
                    self.cache.set_retry_backoff(
                        id,
                        self.config.retry_backoff,
                        self.config.retry_backoff_cap,
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Complete a streaming upload and finalize the entry.
    async fn finalize_streaming_locked(
        &self,
        id: &ContentId,
        incremental: &dyn IncrementalStore,
    ) -> OffloadResult<()> {
        self.ensure_resident_all(id).await?;
        if self.is_shutdown() {
            return Err(OffloadError::Cancelled);
        }

        let started_at = wall_nanos();
        let view = self.view(id)?;
        match incremental.complete_incremental_write(id, view).await {
            Ok(()) => {
                let size = self.cache.size(id)?;
                self.cache.mark_flushed(id, size, started_at)?;
                self.cache.clear_retry_backoff(id);
                // Writes that landed mid-finalize put the entry back in
                // Pending; only a still-Uploading entry finalizes.
                if self
                    .cache
                    .transition_if(id, CacheState::Uploading, CacheState::Cached)?
                {
                    self.cache
                        .transition_if(id, CacheState::Cached, CacheState::Finalized)?;
                }
                debug!(id = %id, size, "entry finalized");
                Ok(())
            }
            Err(StoreError::Cancelled) => Err(OffloadError::Cancelled),
            Err(e) => {
                self.revert_uploading(id);
                if e.is_retryable() {
                    self.cache.set_retry_backoff(
                        id,
                        self.config.retry_backoff,
                        self.config.retry_backoff_cap,
                    );
                }
                Err(e.into())
            }
        }
    }

    fn revert_uploading(&self, id: &ContentId) {
        // Best effort: the entry may already be Pending again (a write
        // raced the flush) or gone entirely.
        if let Ok(true) = self
            .cache
            .transition_if(id, CacheState::Uploading, CacheState::Pending)
        {
            debug!(id = %id, "flush interrupted; entry back to pending");
        }
    }

    fn view(&self, id: &ContentId) -> OffloadResult<Arc<dyn ContentView>> {
        let handle = self.cache.entry(id)?;
        Ok(CacheContentView::new(
            Arc::clone(&self.cache),
            id.clone(),
            handle,
            self.shutdown.subscribe(),
        ) as Arc<dyn ContentView>)
    }

    // ---- read path ----

    /// Serve a read from the cache, fetching absent ranges from the store
    /// (plus sequential prefetch) on miss.
    ///
    /// Dirty entries always become servable, because dirty entries are
    /// never evicted. A clean range that eviction pressure keeps pushing
    /// back out is served straight from the store instead of thrashing.
    pub async fn read_at(
        &self,
        id: &ContentId,
        buf: &mut [u8],
        offset: u64,
    ) -> OffloadResult<usize> {
        for _ in 0..3 {
            match self.cache.read_at(id, buf, offset) {
                Ok(n) => return Ok(n),
                Err(CacheError::NotFound(_)) => {
                    self.fetch_absent(id, offset, buf.len()).await?;
                }
                Err(CacheError::Miss {
                    offset: gap_offset,
                    len: gap_len,
                    ..
                }) => {
                    self.fetch_range(id, gap_offset, gap_len, true).await?;
                    // Then bring in the rest of the request, so the retry
                    // does not discover the gaps one at a time.
                    let Ok(size) = self.cache.size(id) else {
                        continue; // evicted under us; start over
                    };
                    let end = (offset + buf.len() as u64).min(size);
                    if end > offset {
                        // Under eviction pressure this can fail to stick;
                        // the loop (and the store fallback below) covers it.
                        if let Err(e) = self.ensure_resident(id, offset, end - offset).await {
                            debug!(id = %id, error = %e, "range did not stay resident");
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(id = %id, offset, "cache cannot hold range; serving read from store");
        let size = self.store.get_size(id).await?;
        if offset >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let n = self.store.read_at(id, &mut buf[..want], offset).await?;
        Ok(n)
    }

    /// First touch of an evicted (or never-cached) object: size it in the
    /// store and fetch the demanded range.
    async fn fetch_absent(&self, id: &ContentId, offset: u64, len: usize) -> OffloadResult<()> {
        let durable_size = self.store.get_size(id).await?;
        if durable_size == 0 || offset >= durable_size {
            // Give the entry a shape so the retried read can answer
            // (empty or short) from the cache.
            self.cache
                .populate_slice(id, 0, Bytes::new(), durable_size)?;
            return Ok(());
        }
        self.fetch_range(id, offset, len.max(1) as u64, true).await
    }

    /// Fetch `[offset, offset + len)` chunk-aligned from the store into
    /// the cache. The demanded chunks propagate errors; `prefetch` extends
    /// the fetch by `prefetch_blocks` chunks best-effort.
    async fn fetch_range(
        &self,
        id: &ContentId,
        offset: u64,
        len: u64,
        prefetch: bool,
    ) -> OffloadResult<()> {
        let chunk_size = self.cache.chunk_size();
        let durable_size = self.store.get_size(id).await?;

        let first_chunk = offset / chunk_size;
        let last_chunk = (offset + len.max(1) - 1) / chunk_size;
        self.fetch_chunks(id, first_chunk, last_chunk, durable_size)
            .await?;

        if prefetch && self.config.prefetch_blocks > 0 {
            let from = last_chunk + 1;
            let to = last_chunk + u64::from(self.config.prefetch_blocks);
            if from * chunk_size < durable_size {
                if let Err(e) = self.fetch_chunks(id, from, to, durable_size).await {
                    debug!(id = %id, error = %e, "prefetch failed; ignored");
                }
            }
        }
        Ok(())
    }

    async fn fetch_chunks(
        &self,
        id: &ContentId,
        first_chunk: u64,
        last_chunk: u64,
        durable_size: u64,
    ) -> OffloadResult<()> {
        let chunk_size = self.cache.chunk_size();
        for chunk in first_chunk..=last_chunk {
            let start = chunk * chunk_size;
            if start >= durable_size {
                break;
            }
            let want = chunk_size.min(durable_size - start) as usize;

            let _permit = self
                .downloads
                .acquire()
                .await
                .expect("download pool closed");
            let mut buf = vec![0u8; want];
            let n = self.store.read_at(id, &mut buf, start).await?;
            if n == 0 {
                return Err(OffloadError::Store(StoreError::Io(std::io::Error::other(
                    format!("store returned no data at offset {start}"),
                ))));
            }
            buf.truncate(n);
            self.cache
                .populate_slice(id, start, Bytes::from(buf), durable_size)?;
        }
        Ok(())
    }

    /// Fill every gap of an incompletely-resident entry from the store,
    /// so a flush can read the whole range. A gap that a fetch fails to
    /// shrink (the store object is shorter than the entry believes) is an
    /// error rather than a spin.
    async fn ensure_resident(&self, id: &ContentId, start: u64, len: u64) -> OffloadResult<()> {
        let mut last_gap = None;
        while let Some(gap) = self.cache.first_gap(id, start, len)? {
            if last_gap == Some(gap) {
                return Err(OffloadError::Store(StoreError::Io(std::io::Error::other(
                    format!("range [{}, +{}) cannot be made resident", gap.0, gap.1),
                ))));
            }
            last_gap = Some(gap);
            self.fetch_range(id, gap.0, gap.1, false).await?;
        }
        Ok(())
    }

    async fn ensure_resident_all(&self, id: &ContentId) -> OffloadResult<()> {
        let size = self.cache.size(id)?;
        if size == 0 {
            return Ok(());
        }
        self.ensure_resident(id, 0, size).await
    }

    /// Flush and finalize everything dirty, for an orderly shutdown.
    pub async fn drain(&self) -> OffloadResult<()> {
        let mut ids = self.cache.flush_candidates(Duration::ZERO);
        ids.extend(self.cache.finalize_candidates(Duration::ZERO));
        ids.sort();
        ids.dedup();

        for id in ids {
            match self.flush_and_finalize(&id).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(id = %id, error = %e, "drain flush failed"),
            }
        }
        Ok(())
    }
}
