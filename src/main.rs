use dotenv::dotenv;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod backup;
mod config;
mod scheduler;

use backup::cycle::BackupManager;
use backup::dump::PgDumpProducer;
use backup::storage::create_object_store;
use config::BackupConfig;
use scheduler::BackupScheduler;

#[tokio::main]
async fn main() -> backup::Result<()> {
    // Load .env file
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(BackupConfig::from_env()?);
    info!(
        databases = ?config.database_names,
        bucket = %config.s3_bucket,
        schedule = %config.cron_schedule,
        "Configuration loaded"
    );

    let store = create_object_store(&config).await;
    let dumper = PgDumpProducer::from_path_lookup();
    let manager = BackupManager::new(config.clone(), Arc::new(dumper), Arc::from(store));

    let scheduler = BackupScheduler::new(&config.cron_schedule, Arc::new(manager))?;
    scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
