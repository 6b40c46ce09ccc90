use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use driftfs_types::{CacheState, ContentId, SliceId, SliceState};
use driftfs_wal::{Persister, SliceRecord, WalError};

use crate::entry::{EntryHandle, Slice};
use crate::error::{CacheError, CacheResult};

/// Configuration for the content cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum resident slice bytes before clean entries are evicted
    /// (default: 256 MiB).
    pub max_bytes: u64,
    /// Chunk size used for log addressing and prefetch granularity
    /// (default: 1 MiB). Must not change across restarts of the same log.
    pub chunk_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            chunk_size: 1024 * 1024,
        }
    }
}

/// Point-in-time cache counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub resident_bytes: u64,
    pub read_only: bool,
}

/// The range a WriteAt-backend flush must cover, with the wall-clock
/// timestamp the window was computed at (slices written later are not
/// marked clean by this flush).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushWindow {
    pub start: u64,
    pub len: u64,
    pub computed_at: i64,
}

/// In-memory slice store keyed by content id, coupled to the write-ahead
/// log: every mutation is appended to the log before it becomes visible.
pub struct ContentCache {
    entries: RwLock<HashMap<ContentId, Arc<EntryHandle>>>,
    persister: Arc<dyn Persister>,
    config: CacheConfig,
    total_bytes: AtomicU64,
    read_only: AtomicBool,
    closed: AtomicBool,
}

/// Wall-clock nanoseconds, for the log's `created_at` field. Scheduling
/// decisions use monotonic `Instant`s instead.
pub(crate) fn wall_nanos() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl ContentCache {
    pub fn new(persister: Arc<dyn Persister>, config: CacheConfig) -> Self {
        info!(
            max_bytes = config.max_bytes,
            chunk_size = config.chunk_size,
            wal = persister.is_enabled(),
            "content cache created"
        );
        Self {
            entries: RwLock::new(HashMap::new()),
            persister,
            config,
            total_bytes: AtomicU64::new(0),
            read_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Chunk size the cache addresses the log with.
    pub fn chunk_size(&self) -> u64 {
        self.config.chunk_size
    }

    /// `true` once a log growth failure has made the cache read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().expect("entry map poisoned").len(),
            resident_bytes: self.total_bytes.load(Ordering::Relaxed),
            read_only: self.is_read_only(),
        }
    }

    fn check_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// The entry handle for a content id; the offloader uses it for the
    /// flush token and the multipart context.
    pub fn entry(&self, id: &ContentId) -> CacheResult<Arc<EntryHandle>> {
        self.entries
            .read()
            .expect("entry map poisoned")
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| CacheError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.entries
            .read()
            .expect("entry map poisoned")
            .contains_key(id)
    }

    fn get_or_create(
        &self,
        id: &ContentId,
        state: CacheState,
        complete: bool,
    ) -> Arc<EntryHandle> {
        if let Some(handle) = self.entries.read().expect("entry map poisoned").get(id) {
            return Arc::clone(handle);
        }
        let mut map = self.entries.write().expect("entry map poisoned");
        Arc::clone(
            map.entry(id.clone())
                .or_insert_with(|| EntryHandle::new(state, complete)),
        )
    }

    // ---- write path ----

    /// Buffer a write. The slice is appended to the log first (split at
    /// chunk boundaries, one record per touched chunk), then overlaid in
    /// memory. Zero-length writes are a no-op.
    pub fn write_at(&self, id: &ContentId, data: &[u8], offset: u64) -> CacheResult<()> {
        self.check_open()?;
        if data.is_empty() {
            return Ok(());
        }
        if self.is_read_only() {
            return Err(CacheError::ReadOnly);
        }

        let chunk_size = self.config.chunk_size;
        let last_chunk = (offset + data.len() as u64 - 1) / chunk_size;
        if last_chunk > u64::from(u32::MAX) {
            return Err(CacheError::OffsetOutOfRange(offset));
        }

        let created_at = wall_nanos();
        let handle = self.get_or_create(id, CacheState::Pending, true);
        let mut inner = handle.inner.lock().expect("entry lock poisoned");

        let mut added = 0u64;
        let mut pos = 0usize;
        let mut abs = offset;
        while pos < data.len() {
            let chunk_idx = (abs / chunk_size) as u32;
            let offset_in_chunk = (abs % chunk_size) as u32;
            let take = ((chunk_size - u64::from(offset_in_chunk)) as usize).min(data.len() - pos);
            let payload = Bytes::copy_from_slice(&data[pos..pos + take]);
            let slice_id = SliceId::generate();

            let record = SliceRecord {
                content_id: id.clone(),
                chunk_idx,
                slice_id: slice_id.clone(),
                offset: offset_in_chunk,
                data: payload.clone(),
                state: SliceState::Pending,
                created_at,
                block_refs: Vec::new(),
            };
            if let Err(e) = self.persister.append_slice(&record) {
                if matches!(e, WalError::WalFull(_)) {
                    self.read_only.store(true, Ordering::Release);
                    error!(error = %e, "WAL cannot grow; cache is now read-only");
                }
                return Err(e.into());
            }

            inner.slices.push(Slice {
                id: slice_id,
                chunk_idx,
                offset_in_chunk,
                data: payload,
                state: SliceState::Pending,
                created_at,
                block_refs: Vec::new(),
            });
            inner.size = inner.size.max(abs + take as u64);
            added += take as u64;
            pos += take;
            abs += take as u64;
        }

        inner.bytes += added;
        inner.dirty_since = Instant::now();
        inner.next_retry_at = None;
        inner.retry_delay = None;
        if inner.state != CacheState::Pending {
            // Every state may fall back to Pending on a write.
            inner.state = CacheState::Pending;
        }
        inner.recheck_complete(chunk_size);
        drop(inner);

        self.total_bytes.fetch_add(added, Ordering::Relaxed);
        debug!(id = %id, offset, len = data.len(), "cache write");
        self.evict_if_needed();
        Ok(())
    }

    // ---- read path ----

    /// Fill `buf` with the latest byte value at every position. Bytes no
    /// slice covers read as zeros inside `[0, size)`; reads past the end
    /// are short. For entries re-materialized from the store, a gap is a
    /// [`CacheError::Miss`] naming the first absent range.
    pub fn read_at(&self, id: &ContentId, buf: &mut [u8], offset: u64) -> CacheResult<usize> {
        self.check_open()?;
        let handle = self.entry(id)?;
        let inner = handle.inner.lock().expect("entry lock poisoned");

        if offset >= inner.size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((inner.size - offset) as usize);

        if !inner.complete {
            if let Some((gap_offset, gap_len)) =
                inner.first_gap(offset, want as u64, self.config.chunk_size)
            {
                return Err(CacheError::Miss {
                    content_id: id.clone(),
                    offset: gap_offset,
                    len: gap_len,
                });
            }
        }

        buf[..want].fill(0);
        inner.overlay_read(&mut buf[..want], offset, self.config.chunk_size);
        Ok(want)
    }

    /// Current logical size.
    pub fn size(&self, id: &ContentId) -> CacheResult<u64> {
        let handle = self.entry(id)?;
        let inner = handle.inner.lock().expect("entry lock poisoned");
        Ok(inner.size)
    }

    /// First sub-range of `[offset, offset + len)` not resident in memory,
    /// for the offloader's read-through.
    pub fn first_gap(
        &self,
        id: &ContentId,
        offset: u64,
        len: u64,
    ) -> CacheResult<Option<(u64, u64)>> {
        let handle = self.entry(id)?;
        let inner = handle.inner.lock().expect("entry lock poisoned");
        if inner.complete {
            return Ok(None);
        }
        let end = (offset + len).min(inner.size);
        if end <= offset {
            return Ok(None);
        }
        Ok(inner.first_gap(offset, end - offset, self.config.chunk_size))
    }

    // ---- state machine ----

    pub fn state(&self, id: &ContentId) -> CacheResult<CacheState> {
        let handle = self.entry(id)?;
        let inner = handle.inner.lock().expect("entry lock poisoned");
        Ok(inner.state)
    }

    /// Explicit state transition. Illegal transitions assert in debug
    /// builds and are rejected in release builds.
    pub fn set_state(&self, id: &ContentId, to: CacheState) -> CacheResult<()> {
        let handle = self.entry(id)?;
        let mut inner = handle.inner.lock().expect("entry lock poisoned");
        let from = inner.state;
        if !from.can_transition_to(to) {
            debug_assert!(false, "invalid cache state transition {from} -> {to}");
            return Err(CacheError::InvalidTransition { from, to });
        }
        inner.state = to;
        debug!(id = %id, %from, %to, "state transition");
        Ok(())
    }

    /// Transition only if the entry is still in `from`; returns whether
    /// the transition happened. Used by the offloader to complete a flush
    /// without clobbering a concurrent write's fallback to `Pending`.
    pub fn transition_if(
        &self,
        id: &ContentId,
        from: CacheState,
        to: CacheState,
    ) -> CacheResult<bool> {
        let handle = self.entry(id)?;
        let mut inner = handle.inner.lock().expect("entry lock poisoned");
        if inner.state != from {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            debug_assert!(false, "invalid cache state transition {from} -> {to}");
            return Err(CacheError::InvalidTransition { from, to });
        }
        inner.state = to;
        debug!(id = %id, %from, %to, "state transition");
        Ok(true)
    }

    // ---- flush bookkeeping ----

    pub fn get_flushed_offset(&self, id: &ContentId) -> CacheResult<u64> {
        let handle = self.entry(id)?;
        let inner = handle.inner.lock().expect("entry lock poisoned");
        Ok(inner.flushed_offset)
    }

    /// Raise the prefix-durable watermark. The watermark never moves
    /// backwards; lower values are ignored.
    pub fn set_flushed_offset(&self, id: &ContentId, flushed: u64) -> CacheResult<()> {
        let handle = self.entry(id)?;
        let mut inner = handle.inner.lock().expect("entry lock poisoned");
        inner.flushed_offset = inner.flushed_offset.max(flushed);
        Ok(())
    }

    /// The range a WriteAt-backend flush must write, or `None` when the
    /// entry is clean. The range starts at the durable watermark, pulled
    /// down to the lowest dirty slice so overwrites under the watermark
    /// are re-flushed too.
    pub fn flush_window(&self, id: &ContentId) -> CacheResult<Option<FlushWindow>> {
        let handle = self.entry(id)?;
        let inner = handle.inner.lock().expect("entry lock poisoned");

        let chunk_size = self.config.chunk_size;
        let dirty_low = inner
            .slices
            .iter()
            .filter(|s| s.state.is_dirty())
            .map(|s| s.start(chunk_size))
            .min();

        let start = match dirty_low {
            Some(low) => low.min(inner.flushed_offset),
            None if inner.flushed_offset >= inner.size => return Ok(None),
            None => inner.flushed_offset,
        };
        if start >= inner.size {
            return Ok(None);
        }
        Ok(Some(FlushWindow {
            start,
            len: inner.size - start,
            computed_at: wall_nanos(),
        }))
    }

    /// Record a successful WriteAt flush of `[0, up_to)`: slices written
    /// before the window was computed become clean and the watermark
    /// rises. Slices written after the window stay dirty.
    pub fn mark_flushed(&self, id: &ContentId, up_to: u64, computed_at: i64) -> CacheResult<()> {
        let handle = self.entry(id)?;
        let mut inner = handle.inner.lock().expect("entry lock poisoned");
        for slice in &mut inner.slices {
            if slice.state.is_dirty() && slice.created_at <= computed_at {
                slice.state = SliceState::Flushed;
            }
        }
        inner.flushed_offset = inner.flushed_offset.max(up_to);
        Ok(())
    }

    /// Whether any slice still needs flushing.
    pub fn has_dirty_slices(&self, id: &ContentId) -> CacheResult<bool> {
        let handle = self.entry(id)?;
        let inner = handle.inner.lock().expect("entry lock poisoned");
        Ok(inner.slices.iter().any(|s| s.state.is_dirty()))
    }

    /// Time since the last write.
    pub fn dirty_age(&self, id: &ContentId) -> CacheResult<Duration> {
        let handle = self.entry(id)?;
        let inner = handle.inner.lock().expect("entry lock poisoned");
        Ok(inner.dirty_since.elapsed())
    }

    /// Content ids in `Pending` state that have been idle for at least
    /// `idle_for` and are past their retry backoff.
    pub fn flush_candidates(&self, idle_for: Duration) -> Vec<ContentId> {
        let now = Instant::now();
        self.entries
            .read()
            .expect("entry map poisoned")
            .iter()
            .filter(|(_, handle)| {
                let inner = handle.inner.lock().expect("entry lock poisoned");
                inner.state == CacheState::Pending
                    && inner.dirty_since.elapsed() >= idle_for
                    && inner.next_retry_at.map_or(true, |at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Content ids stuck in `Uploading` (streaming backends waiting for a
    /// finalize) that have been idle for at least `idle_for` and are past
    /// their retry backoff.
    pub fn finalize_candidates(&self, idle_for: Duration) -> Vec<ContentId> {
        let now = Instant::now();
        self.entries
            .read()
            .expect("entry map poisoned")
            .iter()
            .filter(|(_, handle)| {
                let inner = handle.inner.lock().expect("entry lock poisoned");
                inner.state == CacheState::Uploading
                    && inner.dirty_since.elapsed() >= idle_for
                    && inner.next_retry_at.map_or(true, |at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Push the entry's retry deadline out after a transient store
    /// failure, doubling up to `cap`.
    pub fn set_retry_backoff(&self, id: &ContentId, base: Duration, cap: Duration) {
        if let Ok(handle) = self.entry(id) {
            let mut inner = handle.inner.lock().expect("entry lock poisoned");
            let delay = inner
                .retry_delay
                .map(|d| (d * 2).min(cap))
                .unwrap_or(base);
            inner.retry_delay = Some(delay);
            inner.next_retry_at = Some(Instant::now() + delay);
            warn!(id = %id, delay_ms = delay.as_millis() as u64, "flush retry scheduled");
        }
    }

    /// Clear the retry backoff after a successful flush.
    pub fn clear_retry_backoff(&self, id: &ContentId) {
        if let Ok(handle) = self.entry(id) {
            let mut inner = handle.inner.lock().expect("entry lock poisoned");
            inner.retry_delay = None;
            inner.next_retry_at = None;
        }
    }

    // ---- removal and eviction ----

    /// Remove the content id: a REMOVE record goes to the log (so replay
    /// drops earlier slices), then the entry leaves memory.
    pub fn remove(&self, id: &ContentId) -> CacheResult<()> {
        self.check_open()?;
        if self.is_read_only() {
            return Err(CacheError::ReadOnly);
        }

        if let Err(e) = self.persister.append_remove(id) {
            if matches!(e, WalError::WalFull(_)) {
                self.read_only.store(true, Ordering::Release);
                error!(error = %e, "WAL cannot grow; cache is now read-only");
            }
            return Err(e.into());
        }

        let removed = self
            .entries
            .write()
            .expect("entry map poisoned")
            .remove(id);
        if let Some(handle) = removed {
            let inner = handle.inner.lock().expect("entry lock poisoned");
            self.total_bytes.fetch_sub(inner.bytes, Ordering::Relaxed);
        }
        debug!(id = %id, "cache remove");
        Ok(())
    }

    /// Drop clean entries, least recently written first, until resident
    /// bytes fit `max_bytes`. Entries that are dirty or have an open
    /// streaming upload are never dropped; their data exists nowhere else.
    fn evict_if_needed(&self) {
        if self.total_bytes.load(Ordering::Relaxed) <= self.config.max_bytes {
            return;
        }

        let mut map = self.entries.write().expect("entry map poisoned");
        let mut candidates: Vec<(Instant, ContentId)> = map
            .iter()
            .filter(|(_, handle)| {
                let inner = handle.inner.lock().expect("entry lock poisoned");
                inner.state.is_evictable() && !handle.has_multipart_state()
            })
            .map(|(id, handle)| {
                let inner = handle.inner.lock().expect("entry lock poisoned");
                (inner.dirty_since, id.clone())
            })
            .collect();
        candidates.sort_by_key(|(at, _)| *at);

        for (_, id) in candidates {
            if self.total_bytes.load(Ordering::Relaxed) <= self.config.max_bytes {
                break;
            }
            if let Some(handle) = map.remove(&id) {
                let inner = handle.inner.lock().expect("entry lock poisoned");
                self.total_bytes.fetch_sub(inner.bytes, Ordering::Relaxed);
                debug!(id = %id, bytes = inner.bytes, state = %inner.state, "entry evicted");
            }
        }
    }

    // ---- recovery and read-through injection ----

    /// Recovery-only injection: insert a replayed slice without logging it
    /// again. Entry state derives from the replayed slice states: any
    /// dirty slice makes the entry `Pending` with a zero watermark; an
    /// all-clean entry restores as `Cached` with the watermark at its
    /// size.
    pub fn restore_slice(&self, record: SliceRecord) -> CacheResult<()> {
        self.check_open()?;
        let chunk_size = self.config.chunk_size;
        let handle = self.get_or_create(&record.content_id, CacheState::Pending, true);
        let mut inner = handle.inner.lock().expect("entry lock poisoned");

        let slice = Slice {
            id: record.slice_id,
            chunk_idx: record.chunk_idx,
            offset_in_chunk: record.offset,
            data: record.data,
            state: record.state,
            created_at: record.created_at,
            block_refs: record.block_refs,
        };
        let added = slice.data.len() as u64;
        inner.size = inner.size.max(slice.end(chunk_size));
        inner.bytes += added;
        inner.slices.push(slice);

        if inner.slices.iter().any(|s| s.state.is_dirty()) {
            inner.state = CacheState::Pending;
            inner.flushed_offset = 0;
        } else {
            inner.state = CacheState::Cached;
            inner.flushed_offset = inner.size;
        }
        inner.complete = true;
        drop(inner);

        self.total_bytes.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }

    /// Read-through injection of clean store data. No log append, no
    /// dirtying: the entry is (or becomes) `Cached`, sized to the durable
    /// object. Populated slices sit below cached writes in overlay order,
    /// so they never shadow newer data.
    pub fn populate_slice(
        &self,
        id: &ContentId,
        offset: u64,
        data: Bytes,
        durable_size: u64,
    ) -> CacheResult<()> {
        self.check_open()?;
        if data.is_empty() && self.contains(id) {
            return Ok(());
        }
        let chunk_size = self.config.chunk_size;
        let handle = self.get_or_create(id, CacheState::Cached, false);
        let mut inner = handle.inner.lock().expect("entry lock poisoned");

        let created_at = wall_nanos();
        let mut added = 0u64;
        let mut pos = 0usize;
        let mut abs = offset;
        while pos < data.len() {
            let chunk_idx = (abs / chunk_size) as u32;
            let offset_in_chunk = (abs % chunk_size) as u32;
            let take = ((chunk_size - u64::from(offset_in_chunk)) as usize).min(data.len() - pos);
            inner.slices.insert(
                0,
                Slice {
                    id: SliceId::generate(),
                    chunk_idx,
                    offset_in_chunk,
                    data: data.slice(pos..pos + take),
                    state: SliceState::Flushed,
                    created_at,
                    block_refs: Vec::new(),
                },
            );
            added += take as u64;
            pos += take;
            abs += take as u64;
        }

        inner.size = inner.size.max(durable_size).max(offset + data.len() as u64);
        inner.flushed_offset = inner.flushed_offset.max(durable_size.min(inner.size));
        inner.bytes += added;
        inner.recheck_complete(chunk_size);
        drop(inner);

        self.total_bytes.fetch_add(added, Ordering::Relaxed);
        debug!(id = %id, offset, len = data.len(), "cache populate");
        self.evict_if_needed();
        Ok(())
    }

    // ---- lifecycle ----

    /// Start flushing the log's dirty pages without blocking on disk.
    pub fn sync_wal(&self) -> CacheResult<()> {
        self.check_open()?;
        self.persister.sync()?;
        Ok(())
    }

    /// Close the cache and its log. Idempotent; later operations fail
    /// with `Closed`.
    pub fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.persister.close()?;
        info!("content cache closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftfs_wal::{MmapWal, NullPersister, WalConfig, WalResult};
    use proptest::prelude::*;

    fn cid(name: &[u8]) -> ContentId {
        ContentId::from_bytes(name).unwrap()
    }

    fn wal_cache(dir: &std::path::Path) -> (Arc<MmapWal>, ContentCache) {
        let wal = Arc::new(
            MmapWal::open(dir, WalConfig { initial_size: 1024 }).unwrap(),
        );
        let cache = ContentCache::new(
            Arc::clone(&wal) as Arc<dyn Persister>,
            CacheConfig::default(),
        );
        (wal, cache)
    }

    fn mem_cache(config: CacheConfig) -> ContentCache {
        ContentCache::new(Arc::new(NullPersister::new()), config)
    }

    // -----------------------------------------------------------------------
    // Write and read
    // -----------------------------------------------------------------------

    #[test]
    fn adjacent_writes_concatenate() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, cache) = wal_cache(dir.path());
        let id = cid(b"A");

        cache.write_at(&id, b"hello", 0).unwrap();
        cache.write_at(&id, b"WORLD", 5).unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(cache.read_at(&id, &mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"helloWORLD");
        assert_eq!(cache.size(&id).unwrap(), 10);
        assert_eq!(cache.state(&id).unwrap(), CacheState::Pending);
        assert_eq!(wal.entry_count(), 2);
    }

    #[test]
    fn zero_length_write_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, cache) = wal_cache(dir.path());
        let id = cid(b"A");

        cache.write_at(&id, b"", 0).unwrap();
        assert_eq!(wal.entry_count(), 0);
        assert!(!cache.contains(&id));
    }

    #[test]
    fn sparse_range_reads_as_zeros() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"xy", 4).unwrap();

        let mut buf = [0xffu8; 6];
        assert_eq!(cache.read_at(&id, &mut buf, 0).unwrap(), 6);
        assert_eq!(&buf, b"\0\0\0\0xy");
    }

    #[test]
    fn read_past_end_is_short() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(cache.read_at(&id, &mut buf, 1).unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(cache.read_at(&id, &mut buf, 3).unwrap(), 0);
        assert_eq!(cache.read_at(&id, &mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let cache = mem_cache(CacheConfig::default());
        let mut buf = [0u8; 1];
        assert!(matches!(
            cache.read_at(&cid(b"nope"), &mut buf, 0),
            Err(CacheError::NotFound(_))
        ));
        assert!(matches!(
            cache.size(&cid(b"nope")),
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn overlapping_write_latest_wins() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"aaaaaaaa", 0).unwrap();
        cache.write_at(&id, b"bbbb", 2).unwrap();
        cache.write_at(&id, b"c", 3).unwrap();

        let mut buf = [0u8; 8];
        cache.read_at(&id, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"aabcbbaa");
    }

    #[test]
    fn writes_split_at_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(
            MmapWal::open(dir.path(), WalConfig { initial_size: 1024 }).unwrap(),
        );
        let cache = ContentCache::new(
            Arc::clone(&wal) as Arc<dyn Persister>,
            CacheConfig {
                chunk_size: 16,
                ..CacheConfig::default()
            },
        );
        let id = cid(b"A");

        // 40 bytes from offset 10 touch chunks 0, 1, 2 and 3.
        let data: Vec<u8> = (0..40u8).collect();
        cache.write_at(&id, &data, 10).unwrap();
        assert_eq!(wal.entry_count(), 4);

        let mut buf = vec![0u8; 40];
        assert_eq!(cache.read_at(&id, &mut buf, 10).unwrap(), 40);
        assert_eq!(buf, data);

        let records = wal.recover().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].chunk_idx, 0);
        assert_eq!(records[0].offset, 10);
        assert_eq!(records[0].data.len(), 6);
        assert_eq!(records[3].chunk_idx, 3);
        assert_eq!(records[3].offset, 0);
        assert_eq!(records[3].data.len(), 2);
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    #[test]
    fn flush_cycle_transitions() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();

        cache.set_state(&id, CacheState::Uploading).unwrap();
        assert_eq!(cache.state(&id).unwrap(), CacheState::Uploading);
        cache.set_state(&id, CacheState::Cached).unwrap();
        cache.set_state(&id, CacheState::Finalized).unwrap();
    }

    #[test]
    fn write_during_upload_falls_back_to_pending() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();
        cache.set_state(&id, CacheState::Uploading).unwrap();

        cache.write_at(&id, b"more", 4).unwrap();
        assert_eq!(cache.state(&id).unwrap(), CacheState::Pending);

        // The interrupted flush must not complete the transition now.
        assert!(!cache
            .transition_if(&id, CacheState::Uploading, CacheState::Cached)
            .unwrap());
        assert_eq!(cache.state(&id).unwrap(), CacheState::Pending);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "invalid cache state transition")]
    fn invalid_transition_asserts_in_debug() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();
        let _ = cache.set_state(&id, CacheState::Finalized);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn invalid_transition_rejects_in_release() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();
        assert!(matches!(
            cache.set_state(&id, CacheState::Finalized),
            Err(CacheError::InvalidTransition { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Flush windows
    // -----------------------------------------------------------------------

    #[test]
    fn flush_window_covers_whole_entry_initially() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"0123456789", 0).unwrap();

        let window = cache.flush_window(&id).unwrap().unwrap();
        assert_eq!((window.start, window.len), (0, 10));

        cache.mark_flushed(&id, 10, window.computed_at).unwrap();
        assert_eq!(cache.get_flushed_offset(&id).unwrap(), 10);
        assert!(cache.flush_window(&id).unwrap().is_none());
        assert!(!cache.has_dirty_slices(&id).unwrap());
    }

    #[test]
    fn flush_window_after_append_covers_suffix() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"0123456789", 0).unwrap();
        let w = cache.flush_window(&id).unwrap().unwrap();
        cache.mark_flushed(&id, 10, w.computed_at).unwrap();

        cache.write_at(&id, b"abc", 10).unwrap();
        let window = cache.flush_window(&id).unwrap().unwrap();
        assert_eq!((window.start, window.len), (10, 3));
    }

    #[test]
    fn flush_window_after_overwrite_drops_below_watermark() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"0123456789", 0).unwrap();
        let w = cache.flush_window(&id).unwrap().unwrap();
        cache.mark_flushed(&id, 10, w.computed_at).unwrap();

        cache.write_at(&id, b"XX", 2).unwrap();
        let window = cache.flush_window(&id).unwrap().unwrap();
        assert_eq!((window.start, window.len), (2, 8));

        // The watermark itself never went backwards.
        assert_eq!(cache.get_flushed_offset(&id).unwrap(), 10);
    }

    #[test]
    fn flushed_offset_is_monotonic() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"0123456789", 0).unwrap();

        cache.set_flushed_offset(&id, 6).unwrap();
        cache.set_flushed_offset(&id, 4).unwrap();
        assert_eq!(cache.get_flushed_offset(&id).unwrap(), 6);
        cache.set_flushed_offset(&id, 10).unwrap();
        assert_eq!(cache.get_flushed_offset(&id).unwrap(), 10);
    }

    #[test]
    fn mark_flushed_spares_later_writes() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"early", 0).unwrap();
        let window = cache.flush_window(&id).unwrap().unwrap();

        // A write that lands after the window was computed.
        std::thread::sleep(Duration::from_millis(2));
        cache.write_at(&id, b"late", 5).unwrap();

        cache.mark_flushed(&id, 5, window.computed_at).unwrap();
        assert!(cache.has_dirty_slices(&id).unwrap());
        let next = cache.flush_window(&id).unwrap().unwrap();
        assert_eq!((next.start, next.len), (5, 4));
    }

    // -----------------------------------------------------------------------
    // Candidates and backoff
    // -----------------------------------------------------------------------

    #[test]
    fn flush_candidates_respect_idle_threshold() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();

        assert!(cache.flush_candidates(Duration::from_secs(60)).is_empty());
        assert_eq!(cache.flush_candidates(Duration::ZERO), vec![id]);
    }

    #[test]
    fn flush_candidates_respect_backoff() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();

        cache.set_retry_backoff(&id, Duration::from_secs(30), Duration::from_secs(60));
        assert!(cache.flush_candidates(Duration::ZERO).is_empty());

        cache.clear_retry_backoff(&id);
        assert_eq!(cache.flush_candidates(Duration::ZERO), vec![id]);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();

        let base = Duration::from_millis(500);
        let cap = Duration::from_millis(1200);
        cache.set_retry_backoff(&id, base, cap);
        cache.set_retry_backoff(&id, base, cap);
        cache.set_retry_backoff(&id, base, cap);

        let handle = cache.entry(&id).unwrap();
        let inner = handle.inner.lock().unwrap();
        assert_eq!(inner.retry_delay, Some(cap));
    }

    #[test]
    fn finalize_candidates_are_idle_uploading_entries() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();
        assert!(cache.finalize_candidates(Duration::ZERO).is_empty());

        cache.set_state(&id, CacheState::Uploading).unwrap();
        assert_eq!(cache.finalize_candidates(Duration::ZERO), vec![id]);
    }

    // -----------------------------------------------------------------------
    // Remove and eviction
    // -----------------------------------------------------------------------

    #[test]
    fn remove_appends_to_wal_and_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, cache) = wal_cache(dir.path());
        let id = cid(b"A");

        cache.write_at(&id, b"data", 0).unwrap();
        cache.remove(&id).unwrap();

        assert!(!cache.contains(&id));
        assert_eq!(cache.stats().resident_bytes, 0);
        // Slice + remove records; replay yields nothing.
        assert_eq!(wal.entry_count(), 2);
        assert!(wal.recover().unwrap().is_empty());
    }

    #[test]
    fn eviction_drops_clean_entries_only() {
        let cache = mem_cache(CacheConfig {
            max_bytes: 100,
            ..CacheConfig::default()
        });

        // A clean entry (populated from the store) and a dirty one.
        cache
            .populate_slice(&cid(b"clean"), 0, Bytes::from(vec![1u8; 80]), 80)
            .unwrap();
        cache.write_at(&cid(b"dirty"), &[2u8; 80], 0).unwrap();

        // The write pushed us over budget; only the clean entry may go.
        assert!(!cache.contains(&cid(b"clean")));
        assert!(cache.contains(&cid(b"dirty")));
        assert_eq!(cache.state(&cid(b"dirty")).unwrap(), CacheState::Pending);
    }

    #[test]
    fn dirty_entries_alone_never_evict() {
        let cache = mem_cache(CacheConfig {
            max_bytes: 50,
            ..CacheConfig::default()
        });
        cache.write_at(&cid(b"a"), &[1u8; 40], 0).unwrap();
        cache.write_at(&cid(b"b"), &[2u8; 40], 0).unwrap();

        assert!(cache.contains(&cid(b"a")));
        assert!(cache.contains(&cid(b"b")));
        assert_eq!(cache.stats().resident_bytes, 80);
    }

    #[test]
    fn entries_with_open_multipart_are_not_evicted() {
        let cache = mem_cache(CacheConfig {
            max_bytes: 50,
            ..CacheConfig::default()
        });
        cache
            .populate_slice(&cid(b"up"), 0, Bytes::from(vec![1u8; 40]), 40)
            .unwrap();
        let handle = cache.entry(&cid(b"up")).unwrap();
        handle.multipart().lock().unwrap().upload_id = Some("u-1".into());

        cache
            .populate_slice(&cid(b"other"), 0, Bytes::from(vec![2u8; 40]), 40)
            .unwrap();

        // "other" (clean, no upload) went; "up" stayed.
        assert!(cache.contains(&cid(b"up")));
        assert!(!cache.contains(&cid(b"other")));
    }

    // -----------------------------------------------------------------------
    // Restore and populate
    // -----------------------------------------------------------------------

    fn record(id: &ContentId, offset: u32, data: &[u8], state: SliceState) -> SliceRecord {
        SliceRecord {
            content_id: id.clone(),
            chunk_idx: 0,
            slice_id: SliceId::generate(),
            offset,
            data: Bytes::copy_from_slice(data),
            state,
            created_at: wall_nanos(),
            block_refs: Vec::new(),
        }
    }

    #[test]
    fn restore_dirty_slices_makes_entry_pending() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");

        cache
            .restore_slice(record(&id, 0, b"hello", SliceState::Pending))
            .unwrap();
        cache
            .restore_slice(record(&id, 5, b"WORLD", SliceState::Uploading))
            .unwrap();

        assert_eq!(cache.state(&id).unwrap(), CacheState::Pending);
        assert_eq!(cache.get_flushed_offset(&id).unwrap(), 0);

        let mut buf = [0u8; 10];
        cache.read_at(&id, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"helloWORLD");
    }

    #[test]
    fn restore_all_clean_slices_makes_entry_cached() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");

        cache
            .restore_slice(record(&id, 0, b"durable", SliceState::Flushed))
            .unwrap();

        assert_eq!(cache.state(&id).unwrap(), CacheState::Cached);
        assert_eq!(cache.get_flushed_offset(&id).unwrap(), 7);
    }

    #[test]
    fn populated_entry_misses_on_unfetched_range() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");

        // Object is 100 bytes in the store; only [0, 10) was fetched.
        cache
            .populate_slice(&id, 0, Bytes::from_static(b"0123456789"), 100)
            .unwrap();
        assert_eq!(cache.state(&id).unwrap(), CacheState::Cached);
        assert_eq!(cache.size(&id).unwrap(), 100);

        let mut buf = [0u8; 10];
        assert_eq!(cache.read_at(&id, &mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"0123456789");

        match cache.read_at(&id, &mut buf, 50) {
            Err(CacheError::Miss { offset, len, .. }) => {
                assert_eq!(offset, 50);
                assert_eq!(len, 10);
            }
            other => panic!("expected a miss, got {other:?}"),
        }
        assert_eq!(cache.first_gap(&id, 0, 100).unwrap(), Some((10, 90)));
    }

    #[test]
    fn populate_never_shadows_cached_writes() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");

        cache
            .populate_slice(&id, 0, Bytes::from_static(b"old old old!"), 12)
            .unwrap();
        cache.write_at(&id, b"NEW", 4).unwrap();

        // Re-populating the same range (a racing prefetch) must not cover
        // the write.
        cache
            .populate_slice(&id, 0, Bytes::from_static(b"old old old!"), 12)
            .unwrap();

        let mut buf = [0u8; 12];
        cache.read_at(&id, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"old NEW old!");
        assert_eq!(cache.state(&id).unwrap(), CacheState::Pending);
    }

    #[test]
    fn fully_populated_entry_becomes_complete() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache
            .populate_slice(&id, 0, Bytes::from(vec![7u8; 100]), 100)
            .unwrap();

        assert_eq!(cache.first_gap(&id, 0, 100).unwrap(), None);
        let mut buf = vec![0u8; 100];
        assert_eq!(cache.read_at(&id, &mut buf, 0).unwrap(), 100);
    }

    // -----------------------------------------------------------------------
    // Read-only mode and close
    // -----------------------------------------------------------------------

    struct FullWal;

    impl Persister for FullWal {
        fn append_slice(&self, _: &SliceRecord) -> WalResult<()> {
            Err(WalError::WalFull("disk full".into()))
        }
        fn append_remove(&self, _: &ContentId) -> WalResult<()> {
            Err(WalError::WalFull("disk full".into()))
        }
        fn sync(&self) -> WalResult<()> {
            Ok(())
        }
        fn recover(&self) -> WalResult<Vec<SliceRecord>> {
            Ok(Vec::new())
        }
        fn close(&self) -> WalResult<()> {
            Ok(())
        }
        fn is_enabled(&self) -> bool {
            true
        }
    }

    #[test]
    fn wal_full_marks_cache_read_only() {
        let cache = ContentCache::new(Arc::new(FullWal), CacheConfig::default());
        let id = cid(b"A");

        assert!(matches!(
            cache.write_at(&id, b"data", 0),
            Err(CacheError::Wal(WalError::WalFull(_)))
        ));
        assert!(cache.is_read_only());
        assert!(matches!(
            cache.write_at(&id, b"more", 0),
            Err(CacheError::ReadOnly)
        ));
    }

    #[test]
    fn closed_cache_rejects_operations() {
        let cache = mem_cache(CacheConfig::default());
        let id = cid(b"A");
        cache.write_at(&id, b"data", 0).unwrap();

        cache.close().unwrap();
        cache.close().unwrap(); // idempotent

        let mut buf = [0u8; 4];
        assert!(matches!(
            cache.write_at(&id, b"x", 0),
            Err(CacheError::Closed)
        ));
        assert!(matches!(
            cache.read_at(&id, &mut buf, 0),
            Err(CacheError::Closed)
        ));
    }

    // -----------------------------------------------------------------------
    // Latest-wins property
    // -----------------------------------------------------------------------

    proptest! {
        #[test]
        fn reads_match_a_flat_model(
            writes in proptest::collection::vec(
                (0u64..200, proptest::collection::vec(any::<u8>(), 1..40)),
                1..25,
            )
        ) {
            let cache = mem_cache(CacheConfig {
                chunk_size: 64,
                ..CacheConfig::default()
            });
            let id = cid(b"model");
            let mut model: Vec<u8> = Vec::new();

            for (offset, data) in &writes {
                cache.write_at(&id, data, *offset).unwrap();
                let end = *offset as usize + data.len();
                if model.len() < end {
                    model.resize(end, 0);
                }
                model[*offset as usize..end].copy_from_slice(data);
            }

            prop_assert_eq!(cache.size(&id).unwrap(), model.len() as u64);
            let mut buf = vec![0u8; model.len()];
            prop_assert_eq!(cache.read_at(&id, &mut buf, 0).unwrap(), model.len());
            prop_assert_eq!(&buf, &model);

            // Single-byte probes across the range.
            for p in (0..model.len()).step_by(7) {
                let mut one = [0u8; 1];
                prop_assert_eq!(cache.read_at(&id, &mut one, p as u64).unwrap(), 1);
                prop_assert_eq!(one[0], model[p]);
            }
        }
    }
}
