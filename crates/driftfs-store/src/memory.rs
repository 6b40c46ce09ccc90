use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use driftfs_types::ContentId;

use crate::error::{StoreError, StoreResult};
use crate::traits::ContentStore;

/// In-memory, HashMap-based content store.
///
/// Intended for tests and embedding. Objects are byte vectors behind an
/// `RwLock`; positional writes past the end zero-extend the object.
pub struct MemoryStore {
    objects: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Full object contents, for assertions in tests.
    pub fn object(&self, id: &ContentId) -> Option<Vec<u8>> {
        self.objects.read().expect("lock poisoned").get(id).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn read_at(&self, id: &ContentId, buf: &mut [u8], offset: u64) -> StoreResult<usize> {
        let map = self.objects.read().expect("lock poisoned");
        let data = map.get(id).ok_or_else(|| StoreError::NotFound {
            key: id.to_hex(),
        })?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    async fn write_at(&self, id: &ContentId, data: &[u8], offset: u64) -> StoreResult<()> {
        let mut map = self.objects.write().expect("lock poisoned");
        let object = map.entry(id.clone()).or_default();
        let end = offset as usize + data.len();
        if object.len() < end {
            object.resize(end, 0);
        }
        object[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn get_size(&self, id: &ContentId) -> StoreResult<u64> {
        let map = self.objects.read().expect("lock poisoned");
        map.get(id)
            .map(|d| d.len() as u64)
            .ok_or_else(|| StoreError::NotFound { key: id.to_hex() })
    }

    async fn delete(&self, id: &ContentId) -> StoreResult<()> {
        self.objects.write().expect("lock poisoned").remove(id);
        Ok(())
    }
}
