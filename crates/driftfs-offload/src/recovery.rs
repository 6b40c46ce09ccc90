use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use driftfs_cache::ContentCache;
use driftfs_wal::Persister;

use crate::error::OffloadResult;

/// What a log replay brought back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Slice records replayed into the cache.
    pub slices: usize,
    /// Distinct content ids restored.
    pub entries: usize,
    /// Payload bytes restored.
    pub bytes: u64,
}

/// One-shot startup collaborator that replays the write-ahead log into
/// the cache. It holds the persister and the cache only for the duration
/// of [`run`]; afterwards the background offloader re-flushes whatever
/// came back dirty.
///
/// Recovery runs before the server opens its listen sockets; nothing else
/// touches the cache while it runs.
///
/// [`run`]: Recovery::run
pub struct Recovery {
    persister: Arc<dyn Persister>,
    cache: Arc<ContentCache>,
}

impl Recovery {
    pub fn new(persister: Arc<dyn Persister>, cache: Arc<ContentCache>) -> Self {
        Self { persister, cache }
    }

    /// Replay the log: every surviving slice record is injected into the
    /// cache without being logged again.
    pub fn run(self) -> OffloadResult<RecoveryReport> {
        let records = self.persister.recover()?;

        let mut report = RecoveryReport::default();
        let mut ids = HashSet::new();
        for record in records {
            report.slices += 1;
            report.bytes += record.data.len() as u64;
            ids.insert(record.content_id.clone());
            self.cache.restore_slice(record)?;
        }
        report.entries = ids.len();

        info!(
            slices = report.slices,
            entries = report.entries,
            bytes = report.bytes,
            "cache recovered from write-ahead log"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftfs_cache::CacheConfig;
    use driftfs_types::{CacheState, ContentId};
    use driftfs_wal::{MmapWal, WalConfig};

    fn cid(name: &[u8]) -> ContentId {
        ContentId::from_bytes(name).unwrap()
    }

    fn open_wal(dir: &std::path::Path) -> Arc<MmapWal> {
        Arc::new(MmapWal::open(dir, WalConfig { initial_size: 1024 }).unwrap())
    }

    #[test]
    fn replay_restores_reads_and_dirty_state() {
        let dir = tempfile::tempdir().unwrap();
        let id = cid(b"A");

        // First life: write through a WAL-backed cache, then crash
        // (drop without flushing anything to a store).
        {
            let wal = open_wal(dir.path());
            let cache = ContentCache::new(
                Arc::clone(&wal) as Arc<dyn Persister>,
                CacheConfig::default(),
            );
            cache.write_at(&id, b"hello", 0).unwrap();
            cache.write_at(&id, b"WORLD", 5).unwrap();
            wal.close().unwrap();
        }

        // Second life: replay.
        let wal = open_wal(dir.path());
        let cache = Arc::new(ContentCache::new(
            Arc::clone(&wal) as Arc<dyn Persister>,
            CacheConfig::default(),
        ));
        let report = Recovery::new(wal as Arc<dyn Persister>, Arc::clone(&cache))
            .run()
            .unwrap();

        assert_eq!(report.slices, 2);
        assert_eq!(report.entries, 1);
        assert_eq!(report.bytes, 10);

        let mut buf = [0u8; 10];
        assert_eq!(cache.read_at(&id, &mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"helloWORLD");
        assert_eq!(cache.state(&id).unwrap(), CacheState::Pending);
        assert_eq!(cache.get_flushed_offset(&id).unwrap(), 0);
    }

    #[test]
    fn replay_skips_removed_ids() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = open_wal(dir.path());
            let cache = ContentCache::new(
                Arc::clone(&wal) as Arc<dyn Persister>,
                CacheConfig::default(),
            );
            cache.write_at(&cid(b"keep"), b"kept", 0).unwrap();
            cache.write_at(&cid(b"drop"), b"dropped", 0).unwrap();
            cache.remove(&cid(b"drop")).unwrap();
            wal.close().unwrap();
        }

        let wal = open_wal(dir.path());
        let cache = Arc::new(ContentCache::new(
            Arc::clone(&wal) as Arc<dyn Persister>,
            CacheConfig::default(),
        ));
        let report = Recovery::new(wal as Arc<dyn Persister>, Arc::clone(&cache))
            .run()
            .unwrap();

        assert_eq!(report.entries, 1);
        assert!(cache.contains(&cid(b"keep")));
        assert!(!cache.contains(&cid(b"drop")));
    }

    #[test]
    fn empty_log_recovers_to_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path());
        let cache = Arc::new(ContentCache::new(
            Arc::clone(&wal) as Arc<dyn Persister>,
            CacheConfig::default(),
        ));
        let report = Recovery::new(wal as Arc<dyn Persister>, Arc::clone(&cache))
            .run()
            .unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert_eq!(cache.stats().entries, 0);
    }
}
