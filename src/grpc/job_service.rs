use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::proto::job_service_server::JobService;
use crate::proto::{Job as JobMessage, JobId, JobResponse, JobStatus as JobStatusMessage};
use crate::queue::DispatchQueue;
use crate::store::{JobStatus, JobStore};

/// Client-facing submission gateway. Stateless: any instance may serve
/// any submit or status request.
pub struct JobGateway {
    store: JobStore,
    queue: Arc<Mutex<DispatchQueue>>,
}

impl JobGateway {
    pub fn new(store: JobStore, queue: Arc<Mutex<DispatchQueue>>) -> Self {
        Self { store, queue }
    }
}

#[tonic::async_trait]
impl JobService for JobGateway {
    async fn submit_job(
        &self,
        request: Request<JobMessage>,
    ) -> Result<Response<JobResponse>, Status> {
        let req = request.into_inner();

        if req.command.trim().is_empty() {
            return Err(SchedulerError::InvalidInput("job command cannot be empty".into()).into());
        }

        let job_id = if req.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            req.id
        };

        self.store
            .create_job(&job_id, &req.command)
            .await
            .map_err(Status::from)?;
        tracing::info!(job_id = %job_id, command = %req.command, "job stored");

        if let Err(e) = self.queue.lock().await.push(&job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "failed to enqueue job");
            // The row stays for audit, marked FAILED so it is not
            // indistinguishable from a healthy pending job.
            if let Err(update_err) = self
                .store
                .update_status(&job_id, JobStatus::Failed, "Failed to add job to processing queue")
                .await
            {
                tracing::error!(job_id = %job_id, error = %update_err, "failed to record queue failure");
            }
            return Err(Status::internal("failed to queue job for processing"));
        }
        tracing::info!(job_id = %job_id, "job queued for processing");

        Ok(Response::new(JobResponse {
            job_id,
            success: true,
            message: "Job submitted successfully".to_string(),
        }))
    }

    async fn get_job_status(
        &self,
        request: Request<JobId>,
    ) -> Result<Response<JobStatusMessage>, Status> {
        let req = request.into_inner();

        if req.id.trim().is_empty() {
            return Err(SchedulerError::InvalidInput("job id cannot be empty".into()).into());
        }

        let job = self.store.get_job(&req.id).await.map_err(Status::from)?;

        Ok(Response::new(JobStatusMessage {
            id: job.id,
            status: job.status.to_string(),
            output: job.output.unwrap_or_default(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }))
    }
}
