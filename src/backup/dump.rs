//! Database dump producer
//!
//! Runs `pg_dump` in custom format and gzips its output straight into the
//! destination file, so the dump never has to fit in memory.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};
use which::which;

use crate::backup::{BackupError, Result};

/// Produces a compressed dump of a single database
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DumpProducer: Send + Sync {
    /// Dump the database behind `database_url` into `destination`
    ///
    /// On failure the destination may be left partially written.
    async fn dump(&self, database_url: &str, destination: &Path) -> Result<()>;
}

/// Dumps PostgreSQL databases with the external `pg_dump` utility
#[derive(Debug, Clone)]
pub struct PgDumpProducer {
    program: PathBuf,
}

impl PgDumpProducer {
    /// Create a producer running the given executable
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Locate `pg_dump` in PATH
    ///
    /// Falls back to the bare name when it cannot be found, so a missing
    /// binary surfaces as a dump failure on every cycle.
    pub fn from_path_lookup() -> Self {
        match which("pg_dump") {
            Ok(path) => {
                info!("Found pg_dump executable at {}", path.display());
                Self::new(path)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "pg_dump not found in PATH, dumps will fail until it is installed"
                );
                Self::new("pg_dump")
            }
        }
    }
}

#[async_trait]
impl DumpProducer for PgDumpProducer {
    async fn dump(&self, database_url: &str, destination: &Path) -> Result<()> {
        info!("Dumping database to {}", destination.display());

        let program = self.program.clone();
        let database_url = database_url.to_string();
        let destination = destination.to_path_buf();

        tokio::task::spawn_blocking(move || run_pipeline(&program, &database_url, &destination))
            .await
            .map_err(|e| BackupError::Dump {
                message: format!("dump task panicked: {}", e),
                stderr: String::new(),
            })??;

        info!("Database dumped");
        Ok(())
    }
}

/// Run `<program> <url> -Fc`, gzipping stdout into `destination`
fn run_pipeline(program: &Path, database_url: &str, destination: &Path) -> Result<()> {
    let mut child = Command::new(program)
        .arg(database_url)
        .arg("-Fc")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BackupError::Dump {
            message: format!("failed to spawn {}: {}", program.display(), e),
            stderr: String::new(),
        })?;

    // Drained on its own thread so a full stderr pipe cannot stall the dump
    let stderr_reader = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        })
    });

    // Scoped so stdout is closed before waiting on the child
    let written = match child.stdout.take() {
        Some(mut stdout) => compress_to_file(&mut stdout, destination),
        None => Err(io::Error::other("dump process has no stdout")),
    };

    // Joined before any early return so the reader thread never outlives the call
    let status = child.wait();
    let stderr = stderr_reader
        .map(|handle| handle.join().unwrap_or_default())
        .unwrap_or_default();
    let status = status?;

    // A local write failure kills the dump with SIGPIPE, so it is the real cause
    let bytes = match written {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(
                error = %e,
                exit = %describe_status(status),
                "Failed to write dump to {}",
                destination.display()
            );
            return Err(BackupError::Io(e));
        }
    };

    if !status.success() {
        return Err(BackupError::Dump {
            message: describe_status(status),
            stderr,
        });
    }

    debug!(bytes, "Compressed dump written");
    if !stderr.trim().is_empty() {
        warn!(stderr = %stderr.trim(), "pg_dump reported diagnostics");
    }

    Ok(())
}

/// Copy `input` through a gzip encoder into a new file, returning the uncompressed byte count
fn compress_to_file<R: Read>(input: &mut R, destination: &Path) -> io::Result<u64> {
    let file = File::create(destination)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let copied = io::copy(input, &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(copied)
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("pg_dump exited with status {}", code),
        None => format!("pg_dump terminated by signal ({})", status),
    }
}
