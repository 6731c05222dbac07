//! Retention pruning of archives in the bucket

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::backup::Result;
use crate::backup::storage::{ObjectStore, StoredObject};

/// Keys of the objects last modified strictly before `cutoff`
///
/// Objects without a modification time are never selected.
pub fn select_expired(objects: &[StoredObject], cutoff: DateTime<Utc>) -> Vec<String> {
    objects
        .iter()
        .filter(|object| match object.last_modified {
            Some(modified) => modified < cutoff,
            None => {
                warn!(key = %object.key, "Object has no last modified date, keeping it");
                false
            }
        })
        .map(|object| object.key.clone())
        .collect()
}

/// Delete every object older than `days` days
pub async fn prune_older_than(store: &dyn ObjectStore, days: u32) -> Result<usize> {
    prune_older_than_at(store, days, Utc::now()).await
}

/// Delete every object older than `days` days, measured from `now`
pub async fn prune_older_than_at(
    store: &dyn ObjectStore,
    days: u32,
    now: DateTime<Utc>,
) -> Result<usize> {
    info!(days, "Removing outdated backups");

    let objects = store.list_objects().await?;
    if objects.is_empty() {
        info!("No objects found in bucket");
        return Ok(0);
    }

    let cutoff = now - Duration::days(i64::from(days));
    let expired = select_expired(&objects, cutoff);
    if expired.is_empty() {
        info!("No outdated objects found");
        return Ok(0);
    }

    info!("Removing {} outdated objects", expired.len());
    let removed = store.delete_objects(&expired).await?;
    info!(removed, "Outdated backups removed");

    Ok(removed)
}
