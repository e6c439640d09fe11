//! Worker execution loop.
//!
//! A worker claims one job at a time from the dispatch queue, runs its
//! command through a shell, and finalises the job's state. Transient
//! broker/store errors are retried a bounded number of times; command
//! failures are fed through the retry/dead-letter policy. Multiple
//! worker processes share the queue without coordinating.

pub mod executor;

pub use executor::{CommandRunner, ExecutionResult};

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};
use crate::queue::DispatchQueue;
use crate::store::{Job, JobStatus, JobStore};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct Worker {
    id: String,
    store: JobStore,
    queue: DispatchQueue,
    runner: CommandRunner,
}

impl Worker {
    pub fn new(id: String, store: JobStore, queue: DispatchQueue) -> Self {
        Self {
            id,
            store,
            queue,
            runner: CommandRunner::new(),
        }
    }

    /// Claim and execute jobs until the shutdown token fires.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.id, "worker started, waiting for jobs");

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(worker_id = %self.id, "worker shutting down");
                return;
            }
            match self.process_next(&shutdown).await {
                Ok(()) => {}
                // Empty queue; poll again right away.
                Err(SchedulerError::QueueTimeout) => {}
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "error processing job");
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!(worker_id = %self.id, "worker shutting down");
                            return;
                        }
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn process_next(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let job_id = self.claim_next().await?;
        tracing::info!(worker_id = %self.id, job_id = %job_id, "claimed job");

        let job = match self.fetch_job(&job_id).await {
            Ok(job) => job,
            Err(e) => {
                // Deliberately no Ack: the id stays in processing so the
                // stale reaper can account for it.
                let diagnostic = format!("Failed to retrieve job details: {e}");
                if let Err(update_err) = self
                    .store
                    .update_status(&job_id, JobStatus::Failed, &diagnostic)
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %update_err, "failed to record fetch failure");
                }
                return Err(e);
            }
        };

        self.store.update_status(&job.id, JobStatus::Running, "").await?;

        let result = self.runner.run(&job.id, &job.command, shutdown).await;
        self.finalize(&job.id, result).await
    }

    /// Pop from the queue, retrying transient broker errors. A timeout
    /// is passed straight through as the normal empty-queue signal.
    async fn claim_next(&mut self) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.queue.pop().await {
                Ok(id) => return Ok(id),
                Err(SchedulerError::QueueTimeout) => return Err(SchedulerError::QueueTimeout),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(worker_id = %self.id, attempt, error = %e, "queue pop failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_job(&self, id: &str) -> Result<Job> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.get_job(id).await {
                Ok(job) => return Ok(job),
                // A missing row will not appear on retry.
                Err(e @ SchedulerError::NotFound(_)) => return Err(e),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(job_id = id, attempt, error = %e, "failed to fetch job, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finalize(&mut self, id: &str, result: ExecutionResult) -> Result<()> {
        match result {
            ExecutionResult::Success { output } => {
                self.write_final_status(id, JobStatus::Succeeded, &output).await;
                self.queue.ack(id).await?;
            }
            ExecutionResult::Cancelled { output } => {
                let output = format!("Job cancelled: {output}");
                self.write_final_status(id, JobStatus::Failed, &output).await;
                self.queue.ack(id).await?;
            }
            ExecutionResult::Failure { output, reason } => {
                let diagnostic = failure_diagnostic(&reason, &output);
                let (retries, max_retries) = self.store.increment_retry(id).await?;
                if retries <= max_retries {
                    tracing::info!(job_id = id, retries, max_retries, "requeueing failed job");
                    self.store.reset_to_pending(id, &diagnostic).await?;
                    self.queue.requeue(id).await?;
                } else {
                    tracing::warn!(job_id = id, retries, "retry budget exhausted, dead-lettering");
                    self.write_final_status(id, JobStatus::Failed, &diagnostic).await;
                    self.queue.dead_letter(id).await?;
                }
            }
        }
        Ok(())
    }

    /// Terminal status writes are retried; if every attempt fails the
    /// row is left RUNNING for the stale reaper to reconcile.
    async fn write_final_status(&self, id: &str, status: JobStatus, output: &str) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.update_status(id, status, output).await {
                Ok(()) => return,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(job_id = id, attempt, error = %e, "final status write failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(job_id = id, error = %e, "giving up on final status write");
                    return;
                }
            }
        }
    }
}

fn failure_diagnostic(reason: &str, output: &str) -> String {
    format!("Error: {reason}\nOutput: {output}")
}
