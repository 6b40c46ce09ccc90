use driftfs_types::ContentId;

use crate::error::WalResult;
use crate::persister::Persister;
use crate::record::SliceRecord;

/// Persister that drops everything.
///
/// Selecting it disables crash recovery: the cache runs purely in memory
/// ahead of the content store.
#[derive(Debug, Default)]
pub struct NullPersister;

impl NullPersister {
    pub fn new() -> Self {
        Self
    }
}

impl Persister for NullPersister {
    fn append_slice(&self, _record: &SliceRecord) -> WalResult<()> {
        Ok(())
    }

    fn append_remove(&self, _content_id: &ContentId) -> WalResult<()> {
        Ok(())
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
        false
    }
}
