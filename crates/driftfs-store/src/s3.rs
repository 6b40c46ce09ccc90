use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use tracing::debug;

use crate::client::ObjectClient;
use crate::error::{StoreError, StoreResult};

/// Configuration for the S3 object client.
///
/// `endpoint` and the static credentials are for S3-compatible stores
/// (MinIO, Ceph RGW); leave them unset to use the ambient AWS environment.
#[derive(Clone, Debug, Default)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Path-style addressing, required by most S3-compatible stores.
    pub force_path_style: bool,
}

/// [`ObjectClient`] backed by the AWS S3 SDK.
pub struct S3Client {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Client {
    /// Build a client from the config, falling back to the ambient AWS
    /// environment for anything unset.
    pub async fn connect(config: S3Config) -> StoreResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = config.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = config.endpoint.clone() {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key), Some(secret)) = (
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
        ) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key, secret, None, None, "driftfs-config",
            ));
        }

        let base = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&base)
            .force_path_style(config.force_path_style)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);

        debug!(bucket = %config.bucket, "s3 client connected");
        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }
}

/// Map an SDK error onto the store taxonomy using the service error code.
fn map_sdk_err<E, R>(key: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata,
{
    if matches!(&err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return StoreError::Unavailable(format!("{key}: request could not be dispatched"));
    }

    let code = err.code().map(str::to_owned);
    let message = err
        .message()
        .map(str::to_owned)
        .or_else(|| code.clone())
        .unwrap_or_else(|| "request failed".to_string());

    match code.as_deref() {
        Some("NoSuchKey" | "NotFound" | "NoSuchUpload") => StoreError::NotFound {
            key: key.to_string(),
        },
        Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
            StoreError::PermissionDenied(format!("{key}: {message}"))
        }
        Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable") => {
            StoreError::Unavailable(format!("{key}: {message}"))
        }
        _ => StoreError::Io(std::io::Error::other(format!("{key}: {message}"))),
    }
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn put_object(&self, key: &str, data: Bytes) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_err(key, e))?;
        Ok(())
    }

    async fn get_range(&self, key: &str, offset: u64, len: usize) -> StoreResult<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let end = offset + len as u64 - 1;
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={offset}-{end}"))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            // Reading at or past the end of the object is a short read,
            // not an error.
            Err(e) if e.code() == Some("InvalidRange") => return Ok(Bytes::new()),
            Err(e) => return Err(map_sdk_err(key, e)),
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        Ok(body.into_bytes())
    }

    async fn head(&self, key: &str) -> StoreResult<u64> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_err(key, e))?;
        Ok(output.content_length().unwrap_or(0) as u64)
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_err(key, e))?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> StoreResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_err(key, e))?;
        output.upload_id().map(str::to_owned).ok_or_else(|| {
            StoreError::Io(std::io::Error::other("create-multipart returned no upload id"))
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_err(key, e))?;
        output.e_tag().map(str::to_owned).ok_or_else(|| {
            StoreError::Io(std::io::Error::other("upload-part returned no etag"))
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> StoreResult<()> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|(number, etag)| {
                CompletedPart::builder()
                    .part_number(*number as i32)
                    .e_tag(etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_err(key, e))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_err(key, e))?;
        Ok(())
    }
}
