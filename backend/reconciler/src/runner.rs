//! Long-running background task that ticks the reconciliation scheduler and
//! records every job run, so cadences survive a restart.

use std::sync::Arc;
use std::time::Duration;

use funding_engine::{JobReport, ReconciliationScheduler};
use sqlx::SqlitePool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db;

pub struct RunnerState {
    pub pool: SqlitePool,
    pub scheduler: Arc<ReconciliationScheduler>,
    pub tick_interval_secs: u64,
}

/// Run the scheduler loop until cancelled.
pub async fn run(state: Arc<RunnerState>, cancel: CancellationToken) {
    match db::load_job_runs(&state.pool).await {
        Ok(runs) => {
            for (job, at) in &runs {
                state.scheduler.restore_last_run(*job, *at);
            }
            info!("Restored {} job runs", runs.len());
        }
        Err(e) => error!("Could not load job runs, every job starts due: {e}"),
    }

    let mut interval = tokio::time::interval(Duration::from_secs(state.tick_interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Scheduler ticking every {}s", state.tick_interval_secs);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = tick_once(&state).await {
                    error!("Scheduler tick error: {e}");
                }
            }
        }
    }
    info!("Scheduler stopped");
}

/// Perform a single tick: run due jobs on a blocking thread, then persist
/// their reports. Returns the number of jobs that ran.
async fn tick_once(state: &RunnerState) -> anyhow::Result<usize> {
    let scheduler = state.scheduler.clone();
    let reports: Vec<JobReport> = tokio::task::spawn_blocking(move || scheduler.tick()).await?;

    for report in &reports {
        if let Err(e) = db::save_job_run(&state.pool, report).await {
            error!("Failed to record run of {}: {e}", report.job);
        }
    }
    debug!("Tick ran {} jobs", reports.len());
    Ok(reports.len())
}
