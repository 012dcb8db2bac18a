use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::{Pipeline, TickSummary};

fn log_tick(summary: &TickSummary) {
    if summary.overlapped {
        return;
    }
    let elapsed = summary.finished_at - summary.started_at;
    match &summary.failure {
        None => info!(
            run_id = %summary.run_id,
            elapsed_ms = elapsed.num_milliseconds(),
            "scheduled tick finished"
        ),
        Some(err) => warn!(
            run_id = %summary.run_id,
            elapsed_ms = elapsed.num_milliseconds(),
            kind = %err.kind(),
            error = %err,
            "scheduled tick failed; next tick runs on schedule"
        ),
    }
}

/// One job on the configured cron that runs a full tick each time it fires.
pub async fn build_scheduler(pipeline: Arc<Pipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().schedule.cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let summary = pipeline.run_tick().await;
            log_tick(&summary);
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Run the scheduler until ctrl-c.
pub async fn run_scheduler(pipeline: Arc<Pipeline>) -> Result<()> {
    let cron = pipeline.config().schedule.cron.clone();
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested, stopping scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
