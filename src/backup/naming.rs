//! Naming of backup artifacts
//!
//! Every artifact produced in one cycle shares the cycle timestamp and differs
//! only in the database-name suffix, e.g.
//! `backup-2025-06-01T14-30-00-000Z-app.tar.gz`.

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};

/// Render a cycle timestamp suitable for object keys and file names
///
/// ISO-8601 with millisecond precision where every `:` and `.` is replaced by `-`.
pub fn cycle_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Build the connection URL for a single database from the configured base URL
pub fn database_url(base_url: &str, database: &str) -> String {
    format!("{}/{}", base_url, database)
}

/// A single compressed dump on its way to object storage
#[derive(Debug, Clone, PartialEq)]
pub struct BackupArtifact {
    /// Object key, also used as the local file name
    name: String,
    /// Where the dump is written before upload
    local_path: PathBuf,
    /// Database the dump was taken from
    database: String,
}

impl BackupArtifact {
    pub fn new(timestamp: &str, database: &str, temp_dir: &Path) -> Self {
        let name = format!("backup-{}-{}.tar.gz", timestamp, database);
        let local_path = temp_dir.join(&name);

        Self {
            name,
            local_path,
            database: database.to_string(),
        }
    }

    /// Get the object key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the temporary local path
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Get the database name
    pub fn database(&self) -> &str {
        &self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cycle_timestamp() {
        let timestamp = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();
        assert_eq!(cycle_timestamp(timestamp), "2025-06-01T14-30-00-000Z");

        let with_millis = timestamp + chrono::Duration::milliseconds(123);
        assert_eq!(cycle_timestamp(with_millis), "2025-06-01T14-30-00-123Z");
    }

    #[test]
    fn test_database_url() {
        assert_eq!(
            database_url("postgres://user:pw@host:5432", "app"),
            "postgres://user:pw@host:5432/app"
        );
    }

    #[test]
    fn test_artifact_name_and_path() {
        let artifact = BackupArtifact::new("2025-06-01T14-30-00-000Z", "app", Path::new("/tmp"));

        assert_eq!(artifact.name(), "backup-2025-06-01T14-30-00-000Z-app.tar.gz");
        assert_eq!(
            artifact.local_path(),
            Path::new("/tmp/backup-2025-06-01T14-30-00-000Z-app.tar.gz")
        );
        assert_eq!(artifact.database(), "app");
    }

    #[test]
    fn test_artifacts_of_one_cycle_share_timestamp() {
        let timestamp = cycle_timestamp(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
        let app = BackupArtifact::new(&timestamp, "app", Path::new("/tmp"));
        let analytics = BackupArtifact::new(&timestamp, "analytics", Path::new("/tmp"));

        let app_prefix = app.name().strip_suffix("app.tar.gz").unwrap();
        let analytics_prefix = analytics.name().strip_suffix("analytics.tar.gz").unwrap();
        assert_eq!(app_prefix, analytics_prefix);
        assert_eq!(app_prefix, "backup-2025-01-02T03-04-05-000Z-");

        // Same inputs always produce the same artifact
        assert_eq!(app, BackupArtifact::new(&timestamp, "app", Path::new("/tmp")));
    }
}
