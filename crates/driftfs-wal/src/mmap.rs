use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::MmapMut;
use tracing::{debug, info, warn};

use driftfs_types::ContentId;

use crate::error::{WalError, WalResult};
use crate::persister::Persister;
use crate::record::{self, RawEntry, SliceRecord};

/// File magic at offset 0.
const MAGIC: [u8; 4] = *b"DTTC";
/// On-disk format version.
const VERSION: u16 = 1;
/// Fixed header size; the first record starts here.
pub(crate) const HEADER_SIZE: u64 = 64;
/// Log file name inside the configured directory.
pub const WAL_FILE_NAME: &str = "cache.dat";

/// Configuration for the memory-mapped log.
#[derive(Clone, Debug)]
pub struct WalConfig {
    /// Size the file is created with; doubled on demand (default: 64 MiB).
    pub initial_size: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            initial_size: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

/// Mutable log state. The mapping is dropped while the file grows and
/// whenever the log is closed; `None` outside those windows means the log
/// is unusable and appends fail.
#[derive(Debug)]
struct WalInner {
    file: File,
    map: Option<MmapMut>,
    /// Current file (and mapping) size.
    size: u64,
    entry_count: u32,
    next_offset: u64,
    total_data_size: u64,
    closed: bool,
}

/// Append-only log on a growable memory-mapped file.
///
/// Appends serialize on one mutex; the mapped region is never touched
/// without it, because growth unmaps and remaps the file. Reads happen
/// only in [`Persister::recover`], before concurrent appenders exist.
#[derive(Debug)]
pub struct MmapWal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl MmapWal {
    /// Open (or create) `cache.dat` inside `dir`.
    ///
    /// The directory is created with mode `0755` and the file with `0644`.
    /// An existing file is validated: wrong magic is `Corrupted`, wrong
    /// version is `VersionMismatch`.
    pub fn open(dir: &Path, config: WalConfig) -> WalResult<Self> {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;

        let path = dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut inner = if len == 0 {
            let size = config.initial_size.max(HEADER_SIZE);
            file.set_len(size)?;
            let map = unsafe { MmapMut::map_mut(&file)? };
            let mut inner = WalInner {
                file,
                map: Some(map),
                size,
                entry_count: 0,
                next_offset: HEADER_SIZE,
                total_data_size: 0,
                closed: false,
            };
            inner.write_header();
            info!(path = %path.display(), size, "created write-ahead log");
            inner
        } else {
            if len < HEADER_SIZE {
                return Err(WalError::Corrupted {
                    offset: 0,
                    reason: format!("file of {len} bytes is smaller than the header"),
                });
            }
            let map = unsafe { MmapMut::map_mut(&file)? };

            if map[0..4] != MAGIC {
                return Err(WalError::Corrupted {
                    offset: 0,
                    reason: "bad magic".into(),
                });
            }
            let version = u16::from_le_bytes([map[4], map[5]]);
            if version != VERSION {
                return Err(WalError::VersionMismatch {
                    found: version,
                    expected: VERSION,
                });
            }
            let entry_count = u32::from_le_bytes([map[6], map[7], map[8], map[9]]);
            let next_offset = u64::from_le_bytes([
                map[10], map[11], map[12], map[13], map[14], map[15], map[16], map[17],
            ]);
            let total_data_size = u64::from_le_bytes([
                map[18], map[19], map[20], map[21], map[22], map[23], map[24], map[25],
            ]);
            if next_offset < HEADER_SIZE || next_offset > len {
                return Err(WalError::Corrupted {
                    offset: 10,
                    reason: format!("next_offset {next_offset} outside file of {len} bytes"),
                });
            }
            info!(
                path = %path.display(),
                entries = entry_count,
                next_offset,
                "opened write-ahead log"
            );
            WalInner {
                file,
                map: Some(map),
                size: len,
                entry_count,
                next_offset,
                total_data_size,
                closed: false,
            }
        };

        // Make sure the header hits the mapping before anyone relies on it.
        inner.write_header();

        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records appended over the file's lifetime.
    pub fn entry_count(&self) -> u32 {
        self.inner.lock().expect("WAL mutex poisoned").entry_count
    }

    /// Offset where the next record will land.
    pub fn next_offset(&self) -> u64 {
        self.inner.lock().expect("WAL mutex poisoned").next_offset
    }

    /// Sum of SLICE payload bytes in the log.
    pub fn total_data_size(&self) -> u64 {
        self.inner
            .lock()
            .expect("WAL mutex poisoned")
            .total_data_size
    }

    fn append_bytes(&self, encoded: &[u8], data_len: u64) -> WalResult<u64> {
        let mut inner = self.inner.lock().expect("WAL mutex poisoned");
        if inner.closed {
            return Err(WalError::Closed);
        }

        let offset = inner.next_offset;
        let end = offset + encoded.len() as u64;
        inner.ensure_capacity(end)?;

        let map = inner.map.as_mut().ok_or_else(|| {
            WalError::WalFull("mapping lost after failed growth".into())
        })?;
        map[offset as usize..end as usize].copy_from_slice(encoded);

        inner.entry_count += 1;
        inner.next_offset = end;
        inner.total_data_size += data_len;
        inner.write_header();

        debug!(offset, len = encoded.len(), "WAL append");
        Ok(offset)
    }
}

impl WalInner {
    /// Rewrite the 64-byte header in place. Must only be called while the
    /// mapping exists.
    fn write_header(&mut self) {
        let entry_count = self.entry_count;
        let next_offset = self.next_offset;
        let total_data_size = self.total_data_size;
        let map = self.map.as_mut().expect("header write without mapping");
        map[0..4].copy_from_slice(&MAGIC);
        map[4..6].copy_from_slice(&VERSION.to_le_bytes());
        map[6..10].copy_from_slice(&entry_count.to_le_bytes());
        map[10..18].copy_from_slice(&next_offset.to_le_bytes());
        map[18..26].copy_from_slice(&total_data_size.to_le_bytes());
        map[26..HEADER_SIZE as usize].fill(0);
    }

    /// Grow the file (doubling) until `needed` bytes fit. The mapping is
    /// dropped across `set_len`; callers must not hold references into it.
    fn ensure_capacity(&mut self, needed: u64) -> WalResult<()> {
        if needed <= self.size {
            return Ok(());
        }

        let mut new_size = self.size;
        while new_size < needed {
            new_size *= 2;
        }

        self.map = None;
        if let Err(e) = self.file.set_len(new_size) {
            warn!(new_size, error = %e, "WAL growth failed");
            // Best effort: restore the old mapping so close() can still
            // flush what we have.
            self.map = unsafe { MmapMut::map_mut(&self.file).ok() };
            return Err(WalError::WalFull(e.to_string()));
        }
        let map = unsafe {
            MmapMut::map_mut(&self.file).map_err(|e| WalError::WalFull(e.to_string()))?
        };
        self.map = Some(map);

        info!(old_size = self.size, new_size, "WAL grown");
        self.size = new_size;
        Ok(())
    }
}

impl Persister for MmapWal {
    fn append_slice(&self, record: &SliceRecord) -> WalResult<()> {
        let mut encoded = Vec::with_capacity(record.encoded_len());
        record.encode(&mut encoded)?;
        self.append_bytes(&encoded, record.data.len() as u64)?;
        Ok(())
    }

    fn append_remove(&self, content_id: &ContentId) -> WalResult<()> {
        let mut encoded = Vec::with_capacity(record::encoded_remove_len(content_id));
        record::encode_remove(content_id, &mut encoded);
        self.append_bytes(&encoded, 0)?;
        Ok(())
    }

    fn sync(&self) -> WalResult<()> {
        let inner = self.inner.lock().expect("WAL mutex poisoned");
        if inner.closed {
            return Err(WalError::Closed);
        }
        if let Some(map) = inner.map.as_ref() {
            map.flush_async()?;
        }
        Ok(())
    }

    fn recover(&self) -> WalResult<Vec<SliceRecord>> {
        let inner = self.inner.lock().expect("WAL mutex poisoned");
        if inner.closed {
            return Err(WalError::Closed);
        }
        let map = inner.map.as_ref().ok_or(WalError::Closed)?;

        let mut slices = Vec::new();
        let mut removed = std::collections::HashSet::new();

        let mut pos = HEADER_SIZE;
        while pos < inner.next_offset {
            let buf = &map[pos as usize..inner.next_offset as usize];
            let (entry, consumed) = record::decode_entry(buf, pos)?;
            match entry {
                RawEntry::Slice(record) => slices.push(record),
                RawEntry::LegacyDelete => {}
                RawEntry::Remove(cid) => {
                    removed.insert(cid);
                }
            }
            pos += consumed as u64;
        }

        let before = slices.len();
        slices.retain(|r| !removed.contains(&r.content_id));
        debug!(
            recovered = slices.len(),
            filtered = before - slices.len(),
            removed_ids = removed.len(),
            "WAL recovery complete"
        );
        Ok(slices)
    }

    fn close(&self) -> WalResult<()> {
        let mut inner = self.inner.lock().expect("WAL mutex poisoned");
        if inner.closed {
            return Ok(());
        }
        if let Some(map) = inner.map.take() {
            map.flush()?;
        }
        inner.closed = true;
        debug!(path = %self.path.display(), "WAL closed");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

impl Drop for MmapWal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "WAL close on drop failed");
        }
    }
}
