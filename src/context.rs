use std::sync::Arc;

use courier_clock::Clock;
use courier_job::Job;
use getset::Getters;
use sqlx::SqlitePool;

use crate::batch_processor::BatchMessageProcessor;
use crate::collaborators::Collaborators;
use crate::disappearing::ExpirationScheduler;
use crate::errors::JobError;
use crate::sql::get_job::is_cancelled;
use crate::streams::JobSignals;

/// Everything a job body may use while it runs.
#[derive(Getters, Clone)]
#[getset(get = "pub")]
pub struct JobContext {
    job: Arc<Job>,
    worker_id: String,
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    expirations: ExpirationScheduler,
    batch_processor: BatchMessageProcessor,
    signals: JobSignals,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job: Arc<Job>,
        worker_id: String,
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        expirations: ExpirationScheduler,
        batch_processor: BatchMessageProcessor,
        signals: JobSignals,
    ) -> Self {
        JobContext {
            job,
            worker_id,
            pool,
            clock,
            collaborators,
            expirations,
            batch_processor,
            signals,
        }
    }

    /// Returns `JobError::Cancelled` once the job was cancelled or its record is
    /// gone. Job bodies call it after every collaborator call.
    pub async fn check_cancelled(&self) -> Result<(), JobError> {
        match is_cancelled(&self.pool, self.job.id()).await? {
            Some(false) => Ok(()),
            Some(true) => Err(JobError::cancelled(format!(
                "job '{}' was cancelled",
                self.job.id()
            ))),
            None => Err(JobError::cancelled(format!(
                "job '{}' no longer exists",
                self.job.id()
            ))),
        }
    }
}
