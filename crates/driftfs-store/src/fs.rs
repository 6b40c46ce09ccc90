use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

use driftfs_types::ContentId;

use crate::error::{StoreError, StoreResult};
use crate::traits::ContentStore;

/// Local-filesystem content store.
///
/// Content lives at `base/<first-2-hex>/<full-hex>` of the id's hex form,
/// the usual content-addressed fanout that keeps directory sizes bounded.
/// Writes are positional; `delete` unlinks the file.
pub struct FsStore {
    base: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `base`. The directory is created lazily on
    /// the first write.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// On-disk path for a content id.
    pub fn object_path(&self, id: &ContentId) -> PathBuf {
        let hex = id.to_hex();
        self.base.join(&hex[..2]).join(&hex)
    }

    fn map_err(id: &ContentId, e: std::io::Error) -> StoreError {
        match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound { key: id.to_hex() },
            ErrorKind::PermissionDenied => StoreError::PermissionDenied(id.to_hex()),
            _ => StoreError::Io(e),
        }
    }
}

#[async_trait]
impl ContentStore for FsStore {
    async fn read_at(&self, id: &ContentId, buf: &mut [u8], offset: u64) -> StoreResult<usize> {
        let path = self.object_path(id);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| Self::map_err(id, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Self::map_err(id, e))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| Self::map_err(id, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn write_at(&self, id: &ContentId, data: &[u8], offset: u64) -> StoreResult<()> {
        let path = self.object_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_err(id, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| Self::map_err(id, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Self::map_err(id, e))?;
        file.write_all(data)
            .await
            .map_err(|e| Self::map_err(id, e))?;
        file.flush().await.map_err(|e| Self::map_err(id, e))?;

        debug!(id = %id, offset, len = data.len(), "fs store write");
        Ok(())
    }

    async fn get_size(&self, id: &ContentId) -> StoreResult<u64> {
        let meta = fs::metadata(self.object_path(id))
            .await
            .map_err(|e| Self::map_err(id, e))?;
        Ok(meta.len())
    }

    async fn delete(&self, id: &ContentId) -> StoreResult<()> {
        match fs::remove_file(self.object_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::map_err(id, e)),
        }
    }
}

impl FsStore {
    /// Root directory of the store.
    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl std::fmt::Debug for FsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsStore").field("base", &self.base).finish()
    }
}
