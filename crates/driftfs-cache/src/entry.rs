use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;

use driftfs_types::{BlockRef, CacheState, MultipartContext, SliceId, SliceState};

/// One cached write, addressed chunk-relative exactly as it is logged.
#[derive(Clone, Debug)]
pub struct Slice {
    pub id: SliceId,
    pub chunk_idx: u32,
    pub offset_in_chunk: u32,
    pub data: Bytes,
    pub state: SliceState,
    /// Wall-clock nanoseconds at write time.
    pub created_at: i64,
    pub block_refs: Vec<BlockRef>,
}

impl Slice {
    /// Absolute start offset of this slice.
    pub fn start(&self, chunk_size: u64) -> u64 {
        u64::from(self.chunk_idx) * chunk_size + u64::from(self.offset_in_chunk)
    }

    /// Absolute end offset (exclusive).
    pub fn end(&self, chunk_size: u64) -> u64 {
        self.start(chunk_size) + self.data.len() as u64
    }
}

/// Mutable per-entry state, guarded by the handle's mutex.
pub(crate) struct EntryInner {
    /// Slices in write order; later slices win on overlap.
    pub slices: Vec<Slice>,
    /// Highest `offset + len` seen.
    pub size: u64,
    /// Prefix `[0, flushed_offset)` known durable in the content store.
    pub flushed_offset: u64,
    pub state: CacheState,
    /// Whether slices plus zero-fill fully define `[0, size)`. False for
    /// entries re-materialized from the store until every gap is fetched.
    pub complete: bool,
    /// Monotonic timestamp of the most recent write. Drives flush
    /// scheduling, write-gathering, and eviction order.
    pub dirty_since: Instant,
    /// Flush retry backoff deadline after a transient store failure.
    pub next_retry_at: Option<Instant>,
    /// Current backoff step.
    pub retry_delay: Option<std::time::Duration>,
    /// Sum of slice payload lengths, for capacity accounting.
    pub bytes: u64,
}

impl EntryInner {
    pub(crate) fn new(state: CacheState, complete: bool) -> Self {
        let now = Instant::now();
        Self {
            slices: Vec::new(),
            size: 0,
            flushed_offset: 0,
            state,
            complete,
            dirty_since: now,
            next_retry_at: None,
            retry_delay: None,
            bytes: 0,
        }
    }

    /// Overlay every slice intersecting `[offset, offset + buf.len())`
    /// onto `buf`, later slices winning. `buf` must be pre-zeroed; the
    /// caller has already clipped the range to `[0, size)`.
    pub(crate) fn overlay_read(&self, buf: &mut [u8], offset: u64, chunk_size: u64) {
        let start = offset;
        let end = offset + buf.len() as u64;
        for slice in &self.slices {
            let s = slice.start(chunk_size);
            let e = slice.end(chunk_size);
            if e <= start || s >= end {
                continue;
            }
            let from = s.max(start);
            let to = e.min(end);
            buf[(from - start) as usize..(to - start) as usize]
                .copy_from_slice(&slice.data[(from - s) as usize..(to - s) as usize]);
        }
    }

    /// First sub-range of `[offset, offset + len)` no slice covers, or
    /// `None` when the range is fully resident.
    pub(crate) fn first_gap(&self, offset: u64, len: u64, chunk_size: u64) -> Option<(u64, u64)> {
        let start = offset;
        let end = offset + len;
        let mut ranges: Vec<(u64, u64)> = self
            .slices
            .iter()
            .map(|s| (s.start(chunk_size), s.end(chunk_size)))
            .filter(|(s, e)| *e > start && *s < end)
            .collect();
        ranges.sort_unstable();

        let mut cursor = start;
        for (s, e) in ranges {
            if s > cursor {
                return Some((cursor, s - cursor));
            }
            cursor = cursor.max(e);
            if cursor >= end {
                return None;
            }
        }
        if cursor < end {
            Some((cursor, end - cursor))
        } else {
            None
        }
    }

    /// Re-derive `complete` after a populate: true once `[0, size)` has no
    /// gap left.
    pub(crate) fn recheck_complete(&mut self, chunk_size: u64) {
        if !self.complete && self.size > 0 {
            self.complete = self.first_gap(0, self.size, chunk_size).is_none();
        }
    }
}

/// Shared handle to one cache entry.
///
/// The inner mutex serializes metadata and slice mutation; the flush token
/// is held across the whole read→write→state-update cycle of a flush, so
/// at most one flush runs per entry; the multipart context is shared with
/// the streaming store backend for the duration of an upload.
pub struct EntryHandle {
    pub(crate) inner: Mutex<EntryInner>,
    flush_token: Arc<tokio::sync::Mutex<()>>,
    multipart: Arc<Mutex<MultipartContext>>,
}

impl EntryHandle {
    pub(crate) fn new(state: CacheState, complete: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(EntryInner::new(state, complete)),
            flush_token: Arc::new(tokio::sync::Mutex::new(())),
            multipart: Arc::new(Mutex::new(MultipartContext::new())),
        })
    }

    /// The per-entry single-writer flush token.
    pub fn flush_token(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.flush_token)
    }

    /// The entry's multipart bookkeeping.
    pub fn multipart(&self) -> Arc<Mutex<MultipartContext>> {
        Arc::clone(&self.multipart)
    }

    /// Whether a streaming upload is open for this entry.
    pub fn has_multipart_state(&self) -> bool {
        !self
            .multipart
            .lock()
            .expect("multipart lock poisoned")
            .is_empty()
    }
}
