// pgvault/src/backup/s3_upload.rs
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3 as s3;
use aws_smithy_types::byte_stream::Length;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::{DisplayErrorContext, SdkError};
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StorageSettings;
use crate::errors::{BackupError, Result};

const DEFAULT_REGION: &str = "us-east-1";
/// Artifacts above this size go through multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;
const PART_SIZE: u64 = 16 * MIB;
/// S3 rejects part numbers above this.
const MAX_PARTS: u64 = 10_000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const OPERATION_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Failure of a single storage call.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct StoreError {
    pub message: String,
    /// Timeouts, dispatch failures and 5xx answers; worth another attempt.
    pub transient: bool,
}

impl StoreError {
    pub fn permanent(message: impl Into<String>) -> Self {
        StoreError { message: message.into(), transient: false }
    }
}

/// The operations the engine needs from object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams a local file to `bucket/key`.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> std::result::Result<(), StoreError>;

    /// Every key in `bucket` starting with `prefix`.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> std::result::Result<Vec<String>, StoreError>;

    async fn delete_key(&self, bucket: &str, key: &str) -> std::result::Result<(), StoreError>;
}

/// Builds a store for one connection's storage settings.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn connect(&self, settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>>;
}

/// Exponential backoff for uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Uploads with bounded retries on transient failures.
pub async fn upload_with_retry(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    file_path: &Path,
    policy: &RetryPolicy,
) -> Result<u32> {
    let mut attempt = 1;
    loop {
        match store.put_file(bucket, key, file_path).await {
            Ok(()) => return Ok(attempt),
            Err(e) if e.transient && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Upload attempt {}/{} to s3://{}/{} failed: {}. Retrying in {:?}",
                    attempt, policy.max_attempts, bucket, key, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(BackupError::Upload(format!(
                    "s3://{}/{} after {} attempt(s): {}",
                    bucket, key, attempt, e
                )));
            }
        }
    }
}

fn store_error<E>(context: String, err: SdkError<E>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(service) => service.raw().status().as_u16() >= 500,
        _ => false,
    };
    StoreError {
        message: format!("{}: {}", context, DisplayErrorContext(&err)),
        transient,
    }
}

/// Smallest whole-MiB part size, at least [`PART_SIZE`], that fits `size`
/// into [`MAX_PARTS`] parts.
fn part_size_for(size: u64) -> u64 {
    let needed = size.div_ceil(MAX_PARTS).div_ceil(MIB) * MIB;
    PART_SIZE.max(needed)
}

/// S3-compatible store (AWS, MinIO, DigitalOcean Spaces...).
pub struct S3Store {
    client: s3::Client,
}

impl S3Store {
    pub async fn connect(settings: &StorageSettings) -> Self {
        let region = settings.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string());
        // Retries are driven by upload_with_retry, not by the SDK.
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .operation_attempt_timeout(OPERATION_ATTEMPT_TIMEOUT)
                    .build(),
            );
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access), Some(secret)) = (&settings.access_key, &settings.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access,
                secret,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = s3::config::Builder::from(&sdk_config);
        if let Some(force_path_style) = settings.force_path_style {
            builder = builder.force_path_style(force_path_style);
        }
        S3Store { client: s3::Client::from_conf(builder.build()) }
    }

    async fn put_single(&self, bucket: &str, key: &str, file_path: &Path) -> std::result::Result<(), StoreError> {
        let body = ByteStream::from_path(file_path).await.map_err(|e| {
            StoreError::permanent(format!("Failed to create ByteStream from file {}: {}", file_path.display(), e))
        })?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| store_error(format!("PutObject s3://{}/{}", bucket, key), e))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        size: u64,
    ) -> std::result::Result<(), StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error(format!("CreateMultipartUpload s3://{}/{}", bucket, key), e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::permanent("CreateMultipartUpload returned no upload id"))?
            .to_string();

        match self.upload_parts(bucket, key, &upload_id, file_path, size).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                    .send()
                    .await
                    .map_err(|e| store_error(format!("CompleteMultipartUpload s3://{}/{}", bucket, key), e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "Failed to abort multipart upload {} for s3://{}/{}: {}",
                        upload_id,
                        bucket,
                        key,
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        file_path: &Path,
        size: u64,
    ) -> std::result::Result<Vec<CompletedPart>, StoreError> {
        let part_size = part_size_for(size);
        let part_count = size.div_ceil(part_size);
        let mut parts = Vec::with_capacity(part_count as usize);
        for index in 0..part_count {
            let offset = index * part_size;
            let length = part_size.min(size - offset);
            let part_number = (index + 1) as i32;
            let body = ByteStream::read_from()
                .path(file_path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| StoreError::permanent(format!("Failed to read part {} of {}: {}", part_number, file_path.display(), e)))?;
            let uploaded = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| store_error(format!("UploadPart {} s3://{}/{}", part_number, bucket, key), e))?;
            debug!("Uploaded part {}/{} of s3://{}/{}", part_number, part_count, bucket, key);
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(&self, bucket: &str, key: &str, file_path: &Path) -> std::result::Result<(), StoreError> {
        let size = tokio::fs::metadata(file_path)
            .await
            .map_err(|e| StoreError::permanent(format!("Failed to stat {}: {}", file_path.display(), e)))?
            .len();
        info!(
            "Uploading {} ({} bytes) to s3://{}/{}",
            file_path.display(),
            size,
            bucket,
            key
        );
        if size > MULTIPART_THRESHOLD {
            self.put_multipart(bucket, key, file_path, size).await
        } else {
            self.put_single(bucket, key, file_path).await
        }
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> std::result::Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| store_error(format!("ListObjectsV2 s3://{}/{}", bucket, prefix), e))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_key(&self, bucket: &str, key: &str) -> std::result::Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error(format!("DeleteObject s3://{}/{}", bucket, key), e))?;
        Ok(())
    }
}

/// Creates one S3 client per connection.
pub struct S3StoreFactory;

#[async_trait]
impl StoreFactory for S3StoreFactory {
    async fn connect(&self, settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>> {
        if settings.access_key.is_some() != settings.secret_key.is_some() {
            return Err(BackupError::Config(
                "S3 access and secret keys must be configured together".to_string(),
            ));
        }
        if settings.access_key.is_none() {
            debug!("No static S3 credentials configured, using the default AWS credential chain");
        }
        Ok(Arc::new(S3Store::connect(settings).await))
    }
}
