//! AWS S3 implementation of the ObjectStore trait
//!
//! Works against AWS itself or any S3-compatible service reachable through
//! a custom endpoint.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use chrono::{DateTime, Utc};
use s3::config::{BehaviorVersion, Region};
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use tracing::{debug, error, info, warn};

use super::{ObjectStore, StoredObject};
use crate::backup::{BackupError, Result};
use crate::config::BackupConfig;

/// Files above this size are sent as a multipart upload, in parts of this size
const MULTIPART_PART_SIZE: u64 = 16 * 1024 * 1024;

/// Provides AWS S3 storage for database backups
pub struct S3ObjectStore {
    /// S3 client
    client: S3Client,
    /// S3 bucket name
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new S3ObjectStore with the given configuration
    pub async fn new(config: &BackupConfig) -> Self {
        // Default credential provider chain, region and endpoint from config
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.s3_region.clone()));

        if let Some(endpoint) = &config.s3_endpoint {
            info!("Using custom endpoint: {}", endpoint);
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;

        // S3-compatible services generally only support path-style addressing
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.s3_endpoint.is_some())
            .build();

        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.s3_bucket.clone(),
        }
    }

    async fn put_single(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| BackupError::Upload {
                key: key.to_string(),
                message: format!("failed to open {}: {}", path.display(), e),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| upload_error(key, map_s3_error(err, "put_object")))?;

        Ok(())
    }

    async fn put_multipart(&self, key: &str, path: &Path, size: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| upload_error(key, map_s3_error(err, "create_multipart_upload")))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| upload_error(key, "S3 returned no upload id".to_string()))?
            .to_string();

        match self.upload_parts(key, path, size, &upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|err| {
                        upload_error(key, map_s3_error(err, "complete_multipart_upload"))
                    })?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        path: &Path,
        size: u64,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let plan = part_ranges(size);
        let mut parts = Vec::with_capacity(plan.len());

        for PartRange {
            part_number,
            offset,
            length,
        } in plan
        {
            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| {
                    upload_error(key, format!("failed to read part {}: {}", part_number, e))
                })?;

            debug!(key, part_number, length, "Uploading part");
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|err| upload_error(key, map_s3_error(err, "upload_part")))?;

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
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, path: &Path) -> Result<()> {
        info!("Uploading backup to S3 bucket {} with key {}", self.bucket, key);

        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| upload_error(key, format!("failed to stat {}: {}", path.display(), e)))?
            .len();

        let result = if size > MULTIPART_PART_SIZE {
            self.put_multipart(key, path, size).await
        } else {
            self.put_single(key, path).await
        };

        match &result {
            Ok(()) => info!(key, size, "Backup uploaded to S3"),
            Err(e) => error!(key, error = %e, "Failed to upload backup to S3"),
        }
        result
    }

    async fn list_objects(&self) -> Result<Vec<StoredObject>> {
        debug!("Listing objects in S3 bucket {}", self.bucket);

        let resp = self
            .client
            .list_objects()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| BackupError::Prune(map_s3_error(err, "list_objects")))?;

        let objects: Vec<StoredObject> = resp
            .contents()
            .iter()
            .filter_map(|obj| match obj.key() {
                Some(key) => Some(StoredObject {
                    key: key.to_string(),
                    last_modified: obj.last_modified().and_then(to_chrono),
                }),
                None => {
                    warn!("Skipping listed object without a key");
                    None
                }
            })
            .collect();

        debug!("Found {} objects in S3", objects.len());
        Ok(objects)
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<usize> {
        debug!("Deleting {} objects from S3 bucket {}", keys.len(), self.bucket);

        let identifiers = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BackupError::Prune(format!("invalid object identifier: {}", e)))?;

        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .build()
            .map_err(|e| BackupError::Prune(format!("invalid delete request: {}", e)))?;

        let resp = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| BackupError::Prune(map_s3_error(err, "delete_objects")))?;

        for failure in resp.errors() {
            warn!(
                key = failure.key().unwrap_or_default(),
                code = failure.code().unwrap_or_default(),
                message = failure.message().unwrap_or_default(),
                "S3 refused to delete object"
            );
        }

        Ok(resp.deleted().len())
    }
}

/// A slice of the file sent as one multipart part
#[derive(Debug, Clone, Copy, PartialEq)]
struct PartRange {
    /// 1-based, as S3 expects
    part_number: i32,
    offset: u64,
    length: u64,
}

/// Split `size` bytes into consecutive parts of `MULTIPART_PART_SIZE`, the last one shorter
fn part_ranges(size: u64) -> Vec<PartRange> {
    (0..size.div_ceil(MULTIPART_PART_SIZE))
        .map(|index| {
            let offset = index * MULTIPART_PART_SIZE;
            PartRange {
                part_number: (index + 1) as i32,
                offset,
                length: MULTIPART_PART_SIZE.min(size - offset),
            }
        })
        .collect()
}

fn upload_error(key: &str, message: String) -> BackupError {
    BackupError::Upload {
        key: key.to_string(),
        message,
    }
}

/// Describe an AWS S3 error for the given operation
fn map_s3_error<E, R>(error: SdkError<E, R>, operation: &str) -> String
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let kind = match &error {
        SdkError::ConstructionFailure(_) => "client construction error",
        SdkError::DispatchFailure(_) => "dispatch error",
        SdkError::TimeoutError(_) => "timeout",
        SdkError::ResponseError(_) => "response error",
        SdkError::ServiceError(_) => "service error",
        _ => "unknown error",
    };

    format!(
        "S3 {} during {}: {}",
        kind,
        operation,
        DisplayErrorContext(&error)
    )
}

fn to_chrono(timestamp: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}
