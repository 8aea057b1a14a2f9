use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::RefreshConfig;
use crate::controller::RefreshController;

/// Cron-driven refreshes. Each tick goes through `start`, so a tick that lands
/// on a running job is a no-op.
pub async fn maybe_build_scheduler(
    config: &RefreshConfig,
    controller: Arc<RefreshController>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.refresh_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let controller = controller.clone();
        Box::pin(async move {
            let outcome = controller.start();
            info!(run_id = %outcome.run_id(), started = outcome.is_started(), "scheduled refresh tick");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %cron, "refresh scheduler started");
    Ok(Some(sched))
}
