use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use driftfs_cache::CacheConfig;
use driftfs_offload::OffloadConfig;

/// Top-level driftfs configuration, deserializable from TOML.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache: CacheSection,
    pub offloader: OffloaderSection,
    pub store: StoreSection,
}

impl Config {
    /// Parse from a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// `[cache]` section.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    /// Directory for `cache.dat`. Unset disables the write-ahead log
    /// (and with it crash recovery).
    pub path: Option<PathBuf>,
    /// Maximum cached bytes in memory.
    pub size: u64,
    /// Chunk size for log addressing and prefetch. Must not change
    /// across restarts of the same log.
    pub chunk_size: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            path: None,
            size: defaults.max_bytes,
            chunk_size: defaults.chunk_size,
        }
    }
}

impl CacheSection {
    pub(crate) fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_bytes: self.size,
            chunk_size: self.chunk_size,
        }
    }
}

/// `[offloader]` section.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OffloaderSection {
    pub parallel_uploads: usize,
    pub parallel_downloads: usize,
    pub prefetch_blocks: u32,
    pub flush_timeout_ms: u64,
    pub scan_interval_ms: u64,
}

impl Default for OffloaderSection {
    fn default() -> Self {
        let defaults = OffloadConfig::default();
        Self {
            parallel_uploads: defaults.parallel_uploads,
            parallel_downloads: defaults.parallel_downloads,
            prefetch_blocks: defaults.prefetch_blocks,
            flush_timeout_ms: defaults.flush_timeout.as_millis() as u64,
            scan_interval_ms: defaults.scan_interval.as_millis() as u64,
        }
    }
}

impl OffloaderSection {
    pub(crate) fn to_offload_config(&self) -> OffloadConfig {
        OffloadConfig {
            parallel_uploads: self.parallel_uploads,
            parallel_downloads: self.parallel_downloads,
            prefetch_blocks: self.prefetch_blocks,
            flush_timeout: Duration::from_millis(self.flush_timeout_ms),
            scan_interval: Duration::from_millis(self.scan_interval_ms),
            ..OffloadConfig::default()
        }
    }
}

/// `[store]` section: which content store backend to flush into.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum StoreSection {
    /// In-memory store, for tests and ephemeral servers.
    Memory,
    /// Local filesystem store.
    Filesystem { path: PathBuf },
    /// Object storage with streaming multipart upload.
    ObjectStore {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        /// Multipart part size in bytes (default: 5 MiB).
        #[serde(default = "default_part_size")]
        part_size: u64,
    },
}

fn default_part_size() -> u64 {
    5 * 1024 * 1024
}

impl Default for StoreSection {
    fn default() -> Self {
        Self::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.cache.path.is_none());
        assert_eq!(config.offloader.parallel_uploads, 16);
        assert_eq!(config.offloader.parallel_downloads, 4);
        assert_eq!(config.offloader.prefetch_blocks, 4);
        assert!(matches!(config.store, StoreSection::Memory));
    }

    #[test]
    fn parses_filesystem_config() {
        let config = Config::from_toml(
            r#"
            [cache]
            path = "/var/lib/driftfs"
            size = 1073741824

            [store]
            backend = "filesystem"
            path = "/srv/content"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.cache.path.as_deref(),
            Some(std::path::Path::new("/var/lib/driftfs"))
        );
        assert_eq!(config.cache.size, 1 << 30);
        match &config.store {
            StoreSection::Filesystem { path } => {
                assert_eq!(path, std::path::Path::new("/srv/content"))
            }
            other => panic!("expected filesystem store, got {other:?}"),
        }
    }

    #[test]
    fn parses_object_store_config() {
        let config = Config::from_toml(
            r#"
            [store]
            backend = "object-store"
            bucket = "driftfs-content"
            region = "eu-west-1"
            endpoint = "http://localhost:9000"
            access_key_id = "minio"
            secret_access_key = "minio123"
            "#,
        )
        .unwrap();

        match &config.store {
            StoreSection::ObjectStore {
                bucket, part_size, ..
            } => {
                assert_eq!(bucket, "driftfs-content");
                assert_eq!(*part_size, 5 * 1024 * 1024);
            }
            other => panic!("expected object store, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(Config::from_toml("[cache]\nbogus = 1\n").is_err());
    }

    #[test]
    fn offloader_section_converts_durations() {
        let section = OffloaderSection {
            flush_timeout_ms: 1500,
            scan_interval_ms: 100,
            ..OffloaderSection::default()
        };
        let config = section.to_offload_config();
        assert_eq!(config.flush_timeout, Duration::from_millis(1500));
        assert_eq!(config.scan_interval, Duration::from_millis(100));
    }
}
