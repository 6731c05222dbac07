//! Backup module: dumps databases, ships the archives to object storage and
//! prunes archives that fall outside the retention window

pub mod storage;

pub mod cycle;
pub mod dump;
pub mod naming;
pub mod retention;

use std::path::PathBuf;

/// Number of days an archive is kept in the bucket
pub const DEFAULT_RETENTION_DAYS: u32 = 31;

/// Directory the dump of the current database is written to
pub const DEFAULT_TEMP_DIR: &str = "/tmp";

/// Error type for everything a backup cycle can run into
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid cron schedule {expression:?}: {message}")]
    Schedule { expression: String, message: String },

    #[error("Database dump failed: {message}\nstderr: {stderr}")]
    Dump { message: String, stderr: String },

    #[error("Upload of {key} failed: {message}")]
    Upload { key: String, message: String },

    #[error("Failed to remove local file {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Retention pruning failed: {0}")]
    Prune(String),
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;
