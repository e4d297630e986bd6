use std::sync::Arc;

use anyhow::{Context, Result};
use banksync_core::SyncJobStatus;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::orchestrator::{SyncEngine, SyncOptions};

/// Minutes a claimed connection stays out of later passes if its job never records an outcome.
const CLAIM_LEASE_MINS: i64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DueRunSummary {
    pub due: usize,
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
    /// Connections that could not start a job at all (deleted, status changed since listing).
    pub rejected: usize,
}

/// One scheduler pass: sync every active connection whose `next_sync_at` has passed.
pub async fn run_due_syncs(
    engine: &SyncEngine,
    now: DateTime<Utc>,
    batch: usize,
    concurrency: usize,
) -> Result<DueRunSummary> {
    let due = engine
        .ledger()
        .claim_due_connections(now, now + Duration::minutes(CLAIM_LEASE_MINS), batch)
        .await
        .context("claiming due connections")?;
    let mut summary = DueRunSummary {
        due: due.len(),
        ..DueRunSummary::default()
    };
    if due.is_empty() {
        return Ok(summary);
    }

    let runs = due
        .iter()
        .map(|c| engine.trigger_sync(c.tenant_id, c.id, SyncOptions::default()))
        .collect::<Vec<_>>();
    let mut results = std::pin::pin!(stream::iter(runs).buffer_unordered(concurrency.max(1)));
    while let Some(result) = results.next().await {
        match result {
            Ok(run) => match run.status {
                SyncJobStatus::Completed => summary.completed += 1,
                SyncJobStatus::Partial => summary.partial += 1,
                _ => summary.failed += 1,
            },
            Err(err) => {
                warn!(error = %err, "scheduled sync could not start");
                summary.rejected += 1;
            }
        }
    }

    info!(
        due = summary.due,
        completed = summary.completed,
        partial = summary.partial,
        failed = summary.failed,
        rejected = summary.rejected,
        "scheduled sync pass finished"
    );
    Ok(summary)
}

pub async fn maybe_build_scheduler(
    engine: Arc<SyncEngine>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let batch = config.scheduler_batch;
    let concurrency = config.connection_concurrency;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            if let Err(err) = run_due_syncs(&engine, Utc::now(), batch, concurrency).await {
                warn!(error = %err, "scheduled sync pass failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(%cron, batch, concurrency, "sync scheduler configured");
    Ok(Some(sched))
}
