//! Storage module for backup archives
//!
//! This module provides an abstraction layer over the object store holding
//! the archives, so the backup cycle and the retention pass can be exercised
//! without a live bucket.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backup::Result;
use crate::config::BackupConfig;

pub mod s3_storage;

/// Metadata of an object as reported by the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    /// Object key
    pub key: String,
    /// Last modification time, when the store reports one
    pub last_modified: Option<DateTime<Utc>>,
}

/// Provides the object store operations a backup cycle needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file under `key`
    ///
    /// # Arguments
    /// * `key` - Object key in the bucket
    /// * `path` - Local file to stream
    async fn put_object(&self, key: &str, path: &Path) -> Result<()>;

    /// List the objects in the bucket
    ///
    /// A single listing call; buckets larger than one listing page are only
    /// partially returned.
    async fn list_objects(&self) -> Result<Vec<StoredObject>>;

    /// Delete every key in one batch request
    ///
    /// Returns the number of objects the store reports as deleted.
    async fn delete_objects(&self, keys: &[String]) -> Result<usize>;
}

/// Create the object store described by the configuration
pub async fn create_object_store(config: &BackupConfig) -> Box<dyn ObjectStore> {
    Box::new(s3_storage::S3ObjectStore::new(config).await)
}
