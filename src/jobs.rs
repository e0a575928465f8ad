use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

use crate::registry::FeedRegistry;
use crate::store::TrackerStore;

/// Post notification records only serve deduplication; keep a week of them.
const POST_RECORD_RETENTION_DAYS: i64 = 7;

pub async fn start_background_jobs(
    registry: Arc<FeedRegistry>,
    store: Arc<dyn TrackerStore>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let evict_registry = registry.clone();
    let evict_job = Job::new_async("0 */10 * * * *", move |_uuid, _l| {
        let registry = evict_registry.clone();
        Box::pin(async move {
            let evicted = registry.evict_expired();
            debug!("[TRACKER] Evicted {} expired seen-cache entries", evicted);
        })
    })?;

    let prune_job = Job::new_async("0 30 4 * * *", move |_uuid, _l| {
        let store = store.clone();
        Box::pin(async move {
            tokio::spawn(async move {
                if let Err(e) = prune_post_records(store.as_ref()).await {
                    tracing::error!("Failed to prune post notifications: {}", e);
                }
            });
        })
    })?;

    scheduler.add(evict_job).await?;
    scheduler.add(prune_job).await?;
    scheduler.start().await?;

    info!("Background jobs started");
    Ok(scheduler)
}

async fn prune_post_records(store: &dyn TrackerStore) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(POST_RECORD_RETENTION_DAYS);
    let pruned = store.prune_post_notifications(cutoff).await?;
    info!("[TRACKER] Pruned {} post notification records", pruned);
    Ok(pruned)
}
