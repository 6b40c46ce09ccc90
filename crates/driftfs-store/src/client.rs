use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{StoreError, StoreResult};

/// Raw object-storage interface the [`RemoteStore`] drives.
///
/// Implementations: [`S3Client`] against real object storage and
/// [`MemoryObjectClient`] for tests. Keys are the content id's hex form;
/// part numbers start at 1, as in the S3 multipart protocol.
///
/// [`RemoteStore`]: crate::remote::RemoteStore
/// [`S3Client`]: crate::s3::S3Client
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Store a whole object in one request.
    async fn put_object(&self, key: &str, data: Bytes) -> StoreResult<()>;

    /// Read up to `len` bytes at `offset`. Short (or empty) at end of
    /// object; `NotFound` if the object does not exist.
    async fn get_range(&self, key: &str, offset: u64, len: usize) -> StoreResult<Bytes>;

    /// Object size in bytes.
    async fn head(&self, key: &str) -> StoreResult<u64>;

    /// Delete the object. Deleting an absent object is not an error.
    async fn delete_object(&self, key: &str) -> StoreResult<()>;

    /// Start a multipart upload; returns the upload id.
    async fn create_multipart(&self, key: &str) -> StoreResult<String>;

    /// Upload one part; returns its etag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String>;

    /// Complete a multipart upload from `(part_number, etag)` pairs in
    /// part-number order.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> StoreResult<()>;

    /// Abort a multipart upload, discarding its parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()>;
}

/// Request counters, for assertions in tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub puts: u64,
    pub multipart_creates: u64,
    pub parts_uploaded: u64,
    pub completes: u64,
    pub aborts: u64,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

struct ClientState {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    unavailable: bool,
    stats: ClientStats,
}

/// In-memory [`ObjectClient`] for tests and embedding.
///
/// Mimics the S3 multipart contract: parts are buffered per upload id and
/// only become the object on `complete_multipart`. `set_unavailable` makes
/// every mutating call fail with a retryable error, for backoff tests.
pub struct MemoryObjectClient {
    state: Mutex<ClientState>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClientState {
                objects: HashMap::new(),
                uploads: HashMap::new(),
                next_upload: 0,
                unavailable: false,
                stats: ClientStats::default(),
            }),
        }
    }

    /// Toggle transient-failure mode.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().expect("client lock poisoned").unavailable = unavailable;
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> ClientStats {
        self.state.lock().expect("client lock poisoned").stats.clone()
    }

    /// Full object contents, for assertions.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("client lock poisoned")
            .objects
            .get(key)
            .cloned()
    }

    /// Number of multipart uploads still open.
    pub fn open_uploads(&self) -> usize {
        self.state.lock().expect("client lock poisoned").uploads.len()
    }

    fn check_available(state: &ClientState) -> StoreResult<()> {
        if state.unavailable {
            return Err(StoreError::Unavailable("memory client offline".into()));
        }
        Ok(())
    }
}

impl Default for MemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn put_object(&self, key: &str, data: Bytes) -> StoreResult<()> {
        let mut state = self.state.lock().expect("client lock poisoned");
        Self::check_available(&state)?;
        state.objects.insert(key.to_string(), data.to_vec());
        state.stats.puts += 1;
        Ok(())
    }

    async fn get_range(&self, key: &str, offset: u64, len: usize) -> StoreResult<Bytes> {
        let state = self.state.lock().expect("client lock poisoned");
        let data = state.objects.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(Bytes::new());
        }
        let end = (offset + len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[offset..end]))
    }

    async fn head(&self, key: &str) -> StoreResult<u64> {
        let state = self.state.lock().expect("client lock poisoned");
        state
            .objects
            .get(key)
            .map(|d| d.len() as u64)
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        let mut state = self.state.lock().expect("client lock poisoned");
        Self::check_available(&state)?;
        state.objects.remove(key);
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> StoreResult<String> {
        let mut state = self.state.lock().expect("client lock poisoned");
        Self::check_available(&state)?;
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        state.stats.multipart_creates += 1;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String> {
        let mut state = self.state.lock().expect("client lock poisoned");
        Self::check_available(&state)?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::NotFound {
                key: format!("{key} upload {upload_id}"),
            })?;
        let etag = format!("\"{upload_id}-{part_number}\"");
        upload.parts.insert(part_number, (etag.clone(), data.to_vec()));
        state.stats.parts_uploaded += 1;
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().expect("client lock poisoned");
        Self::check_available(&state)?;
        let upload = state
            .uploads
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::NotFound {
                key: format!("{key} upload {upload_id}"),
            })?;

        let mut assembled = Vec::new();
        for (number, etag) in parts {
            let (stored_etag, data) =
                upload.parts.get(number).ok_or_else(|| {
                    StoreError::Io(std::io::Error::other(format!(
                        "complete references missing part {number}"
                    )))
                })?;
            if stored_etag != etag {
                return Err(StoreError::Io(std::io::Error::other(format!(
                    "etag mismatch on part {number}"
                ))));
            }
            assembled.extend_from_slice(data);
        }

        state.objects.insert(key.to_string(), assembled);
        state.stats.completes += 1;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock().expect("client lock poisoned");
        state
            .uploads
            .retain(|id, u| !(id.as_str() == upload_id && u.key == key));
        state.stats.aborts += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let client = MemoryObjectClient::new();
        client.put_object("k", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(client.head("k").await.unwrap(), 5);
        let got = client.get_range("k", 1, 3).await.unwrap();
        assert_eq!(&got[..], b"ell");
    }

    #[tokio::test]
    async fn get_range_clamps_at_end() {
        let client = MemoryObjectClient::new();
        client.put_object("k", Bytes::from_static(b"abc")).await.unwrap();

        assert_eq!(&client.get_range("k", 2, 10).await.unwrap()[..], b"c");
        assert!(client.get_range("k", 3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn multipart_assembles_in_order() {
        let client = MemoryObjectClient::new();
        let upload = client.create_multipart("k").await.unwrap();

        let e2 = client
            .upload_part("k", &upload, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let e1 = client
            .upload_part("k", &upload, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        client
            .complete_multipart("k", &upload, &[(1, e1), (2, e2)])
            .await
            .unwrap();

        assert_eq!(client.object("k").unwrap(), b"hello world");
        assert_eq!(client.open_uploads(), 0);
    }

    #[tokio::test]
    async fn incomplete_upload_is_invisible() {
        let client = MemoryObjectClient::new();
        let upload = client.create_multipart("k").await.unwrap();
        client
            .upload_part("k", &upload, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(matches!(
            client.head("k").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unavailable_mode_fails_mutations() {
        let client = MemoryObjectClient::new();
        client.set_unavailable(true);

        let err = client.put_object("k", Bytes::new()).await.unwrap_err();
        assert!(err.is_retryable());

        client.set_unavailable(false);
        client.put_object("k", Bytes::new()).await.unwrap();
    }
}
