//! Backup cycle orchestration
//!
//! One cycle dumps, uploads and removes the local copy of every configured
//! database in order, then runs a single retention pass. The first failure
//! aborts the cycle: later databases are skipped and nothing is pruned.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backup::dump::DumpProducer;
use crate::backup::naming::{BackupArtifact, cycle_timestamp, database_url};
use crate::backup::retention::prune_older_than;
use crate::backup::storage::ObjectStore;
use crate::backup::{BackupError, Result};
use crate::config::BackupConfig;
use crate::scheduler::CycleRunner;

/// Outcome of a successful cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Timestamp shared by every artifact of the cycle
    pub timestamp: String,
    /// Object keys uploaded, in processing order
    pub uploaded: Vec<String>,
    /// Number of outdated objects removed from the bucket
    pub pruned: usize,
}

/// Runs backup cycles against the configured databases and bucket
pub struct BackupManager {
    config: Arc<BackupConfig>,
    dumper: Arc<dyn DumpProducer>,
    store: Arc<dyn ObjectStore>,
}

impl BackupManager {
    /// Create a new backup manager
    pub fn new(
        config: Arc<BackupConfig>,
        dumper: Arc<dyn DumpProducer>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            dumper,
            store,
        }
    }

    /// Run one full cycle stamped with the current time
    pub async fn run_backup_cycle(&self) -> Result<CycleReport> {
        self.run_backup_cycle_at(Utc::now()).await
    }

    /// Run one full cycle stamped with `now`
    pub async fn run_backup_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        info!("Initiating DB backup");
        let start = Instant::now();
        let timestamp = cycle_timestamp(now);
        let mut uploaded = Vec::with_capacity(self.config.database_names.len());

        for database in &self.config.database_names {
            let artifact = BackupArtifact::new(&timestamp, database, &self.config.temp_dir);
            self.back_up(&artifact)
                .instrument(info_span!("database", name = %database))
                .await?;
            uploaded.push(artifact.name().to_string());
        }

        let pruned = prune_older_than(self.store.as_ref(), self.config.retention_days).await?;

        info!(
            databases = uploaded.len(),
            pruned,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "DB backup complete"
        );

        Ok(CycleReport {
            timestamp,
            uploaded,
            pruned,
        })
    }

    /// Dump, upload and clean up a single database
    async fn back_up(&self, artifact: &BackupArtifact) -> Result<()> {
        info!("Backing up database: {}", artifact.database());
        let url = database_url(&self.config.database_url, artifact.database());

        let shipped = async {
            self.dumper.dump(&url, artifact.local_path()).await?;
            self.store
                .put_object(artifact.name(), artifact.local_path())
                .await
        }
        .await;

        match shipped {
            Ok(()) => remove_local_file(artifact.local_path()).await,
            Err(e) => {
                // Report the failing step; a leftover dump only warrants a warning
                discard_partial_file(artifact.local_path()).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CycleRunner for BackupManager {
    async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_backup_cycle().await
    }
}

async fn remove_local_file(path: &Path) -> Result<()> {
    debug!("Deleting file {}", path.display());
    tokio::fs::remove_file(path)
        .await
        .map_err(|source| BackupError::Cleanup {
            path: path.to_path_buf(),
            source,
        })
}

async fn discard_partial_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, "Failed to remove partial file {}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::dump::MockDumpProducer;
    use crate::backup::storage::{MockObjectStore, StoredObject};
    use chrono::{Duration, TimeZone};
    use mockall::Sequence;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    fn config(temp_dir: &Path, names: &[&str]) -> Arc<BackupConfig> {
        Arc::new(BackupConfig {
            database_url: "postgres://host/db".to_string(),
            database_names: names.iter().map(|s| s.to_string()).collect(),
            cron_schedule: "0 3 * * *".to_string(),
            s3_bucket: "my-bucket".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            retention_days: 31,
            temp_dir: temp_dir.to_path_buf(),
        })
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap()
    }

    /// A dumper that writes a small file, like a real dump would
    fn writing_dumper(times: usize) -> MockDumpProducer {
        let mut dumper = MockDumpProducer::new();
        dumper
            .expect_dump()
            .times(times)
            .returning(|_, path| Ok(std::fs::write(path, b"dump")?));
        dumper
    }

    fn manager(
        dir: &TempDir,
        names: &[&str],
        dumper: MockDumpProducer,
        store: MockObjectStore,
    ) -> BackupManager {
        BackupManager::new(config(dir.path(), names), Arc::new(dumper), Arc::new(store))
    }

    #[tokio::test]
    async fn test_cycle_uploads_every_database_then_prunes_once() {
        let dir = tempdir().unwrap();
        let mut seq = Sequence::new();
        let mut dumper = MockDumpProducer::new();
        let mut store = MockObjectStore::new();

        for (db, key) in [
            ("app", "backup-2025-06-01T03-00-00-000Z-app.tar.gz"),
            ("analytics", "backup-2025-06-01T03-00-00-000Z-analytics.tar.gz"),
        ] {
            let expected_url = format!("postgres://host/db/{}", db);
            let expected_path: PathBuf = dir.path().join(key);
            dumper
                .expect_dump()
                .withf(move |url: &str, path: &Path| url == expected_url && path == expected_path)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, path| Ok(std::fs::write(path, b"dump")?));
            store
                .expect_put_object()
                .withf(move |k: &str, path: &Path| k == key && path.exists())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let stale = "backup-2025-04-01T03-00-00-000Z-app.tar.gz";
        store
            .expect_list_objects()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || {
                Ok(vec![
                    StoredObject {
                        key: stale.to_string(),
                        last_modified: Some(Utc::now() - Duration::days(61)),
                    },
                    StoredObject {
                        key: "backup-recent-app.tar.gz".to_string(),
                        last_modified: Some(Utc::now() - Duration::days(1)),
                    },
                ])
            });
        store
            .expect_delete_objects()
            .withf(move |keys: &[String]| keys == [stale.to_string()])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|keys| Ok(keys.len()));

        let manager = manager(&dir, &["app", "analytics"], dumper, store);
        let report = manager.run_backup_cycle_at(fixed_now()).await.unwrap();

        assert_eq!(report.timestamp, "2025-06-01T03-00-00-000Z");
        assert_eq!(
            report.uploaded,
            vec![
                "backup-2025-06-01T03-00-00-000Z-app.tar.gz",
                "backup-2025-06-01T03-00-00-000Z-analytics.tar.gz",
            ]
        );
        assert_eq!(report.pruned, 1);
        // Local copies are gone once uploaded
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_dump_failure_aborts_cycle() {
        let dir = tempdir().unwrap();
        let mut dumper = MockDumpProducer::new();
        let mut store = MockObjectStore::new();

        dumper
            .expect_dump()
            .withf(|url: &str, _: &Path| url.ends_with("/first"))
            .times(1)
            .returning(|_, path| Ok(std::fs::write(path, b"dump")?));
        dumper
            .expect_dump()
            .withf(|url: &str, _: &Path| url.ends_with("/second"))
            .times(1)
            .returning(|_, path| {
                std::fs::write(path, b"partial")?;
                Err(BackupError::Dump {
                    message: "pg_dump exited with status 1".to_string(),
                    stderr: "connection refused".to_string(),
                })
            });
        dumper
            .expect_dump()
            .withf(|url: &str, _: &Path| url.ends_with("/third"))
            .times(0);
        store
            .expect_put_object()
            .withf(|key: &str, _: &Path| key.ends_with("-first.tar.gz"))
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_list_objects().times(0);
        store.expect_delete_objects().times(0);

        let manager = manager(&dir, &["first", "second", "third"], dumper, store);
        let err = manager.run_backup_cycle_at(fixed_now()).await.unwrap_err();

        assert!(matches!(err, BackupError::Dump { .. }));
        // The partial dump does not linger
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_aborts_cycle() {
        let dir = tempdir().unwrap();
        let dumper = writing_dumper(1);
        let mut store = MockObjectStore::new();

        store.expect_put_object().times(1).returning(|key, _| {
            Err(BackupError::Upload {
                key: key.to_string(),
                message: "S3 dispatch error".to_string(),
            })
        });
        store.expect_list_objects().times(0);
        store.expect_delete_objects().times(0);

        let manager = manager(&dir, &["app", "analytics"], dumper, store);
        let err = manager.run_backup_cycle_at(fixed_now()).await.unwrap_err();

        assert!(matches!(err, BackupError::Upload { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_reported() {
        let dir = tempdir().unwrap();
        // Dump "succeeds" without writing anything, so there is nothing to remove
        let mut dumper = MockDumpProducer::new();
        dumper.expect_dump().times(1).returning(|_, _| Ok(()));
        let mut store = MockObjectStore::new();
        store.expect_put_object().times(1).returning(|_, _| Ok(()));
        store.expect_list_objects().times(0);

        let manager = manager(&dir, &["app", "analytics"], dumper, store);
        let err = manager.run_backup_cycle_at(fixed_now()).await.unwrap_err();

        match err {
            BackupError::Cleanup { path, .. } => assert_eq!(
                path,
                dir.path().join("backup-2025-06-01T03-00-00-000Z-app.tar.gz")
            ),
            other => panic!("expected cleanup failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_successful_cleanup_is_not_an_error() {
        let dir = tempdir().unwrap();
        let dumper = writing_dumper(1);
        let mut store = MockObjectStore::new();
        store.expect_put_object().times(1).returning(|_, _| Ok(()));
        store.expect_list_objects().times(1).returning(|| Ok(Vec::new()));
        store.expect_delete_objects().times(0);

        let manager = manager(&dir, &["app"], dumper, store);
        let report = manager.run_backup_cycle().await.unwrap();

        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(report.pruned, 0);
    }

    #[tokio::test]
    async fn test_prune_failure_fails_cycle() {
        let dir = tempdir().unwrap();
        let dumper = writing_dumper(1);
        let mut store = MockObjectStore::new();
        store.expect_put_object().times(1).returning(|_, _| Ok(()));
        store
            .expect_list_objects()
            .times(1)
            .returning(|| Err(BackupError::Prune("S3 service error".to_string())));

        let manager = manager(&dir, &["app"], dumper, store);
        let err = manager.run_backup_cycle_at(fixed_now()).await.unwrap_err();

        assert!(matches!(err, BackupError::Prune(_)));
    }
}
