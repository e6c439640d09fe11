//! Leader-only maintenance duties.
//!
//! Runs in the instance currently holding the election lease: a ticker
//! that reaps stale RUNNING rows and enqueues due one-shot and
//! recurring jobs. Non-leader instances do none of this but keep
//! serving submission and status requests.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::cron::CronSchedule;
use crate::queue::{DispatchQueue, PENDING_JOBS_QUEUE};
use crate::store::JobStore;

const TICK_INTERVAL: Duration = Duration::from_secs(15);
/// RUNNING rows untouched for this long are presumed orphaned by a
/// crashed worker.
const STALE_CUTOFF_SECS: i64 = 600;
const ENQUEUE_BATCH: i64 = 100;

pub struct MaintenanceLoop {
    store: JobStore,
    queue: DispatchQueue,
}

impl MaintenanceLoop {
    pub fn new(store: JobStore, queue: DispatchQueue) -> Self {
        Self { store, queue }
    }

    /// Run duties until the leadership token is cancelled.
    pub async fn run(mut self, leadership: CancellationToken) {
        tracing::info!("leader duties started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                _ = leadership.cancelled() => {
                    tracing::info!("leader duties stopping");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&mut self) {
        match self.store.mark_stale_running_failed(STALE_CUTOFF_SECS).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "marked stale RUNNING jobs as FAILED"),
            Err(e) => tracing::warn!(error = %e, "stale job sweep failed"),
        }

        let ids = match self.store.due_task_ids(ENQUEUE_BATCH).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "due task scan failed");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }

        if let Ok(depth) = self.queue.depth(PENDING_JOBS_QUEUE).await {
            tracing::debug!(depth, due = ids.len(), "enqueueing due jobs");
        }

        for id in ids {
            if let Err(e) = self.queue.push(&id).await {
                tracing::warn!(job_id = %id, error = %e, "failed to enqueue due job");
                continue;
            }
            if let Err(e) = self.store.clear_execute_at(&id).await {
                tracing::warn!(job_id = %id, error = %e, "failed to clear execute_at");
            }
            self.advance_recurrence(&id).await;
        }
    }

    /// For cron jobs, push next_run_at forward to the firing after now.
    async fn advance_recurrence(&self, id: &str) {
        let job = match self.store.get_job(id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = id, error = %e, "failed to re-read enqueued job");
                return;
            }
        };
        let Some(expr) = job.cron_expr.as_deref() else {
            return;
        };
        match CronSchedule::parse(expr) {
            Ok(schedule) => {
                if let Some(next) = schedule.next_after(Utc::now()) {
                    match self.store.update_next_run(id, next).await {
                        Ok(()) => tracing::debug!(job_id = id, next = %next, "advanced recurrence"),
                        Err(e) => tracing::warn!(job_id = id, error = %e, "failed to update next_run_at"),
                    }
                }
            }
            Err(e) => tracing::warn!(job_id = id, cron = expr, error = %e, "invalid cron expression"),
        }
    }
}
