use std::sync::Arc;

use courier_clock::{Clock, SystemClock};
use courier_job::{DecryptIncoming, Envelope, Job, JobPayload, JobType, SendOutgoing};
use courier_job_spec::JobSpec;
use courier_migrations::{migrate, MigrateError};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::disappearing::{MessageDirection, MessageFinder, NewMessage};
use crate::errors::Result;
use crate::sql::add_job::add_job;
use crate::sql::cancel_job::{cancel_job, cancel_partition, purge_jobs};
use crate::sql::get_job::get_job_by_id;
use crate::sql::messages::insert_message;
use crate::sql::queue_details::{job_counts, QueueCount};
use crate::sql::recover_jobs::force_unlock_workers;
use crate::streams::JobSignals;

/// The WorkerUtils struct provides a set of utility methods for managing jobs.
///
/// This is the primary interface for adding jobs to the queue, cancelling and
/// purging them, and migrating the database schema. Obtained from
/// [`crate::Worker::create_utils`] it wakes the worker's queues directly after
/// every insert.
#[derive(Clone)]
pub struct WorkerUtils {
    /// Database connection pool
    pool: SqlitePool,

    clock: Arc<dyn Clock>,

    /// Notifications of the runners that should pick up added jobs
    signals: JobSignals,
}

impl WorkerUtils {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            signals: JobSignals::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_signals(mut self, signals: JobSignals) -> Self {
        self.signals = signals;
        self
    }

    /// Adds a job to the queue.
    ///
    /// Returns `None` when `spec.job_key` is already used by another record.
    pub async fn add_job(&self, payload: JobPayload, spec: JobSpec) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let job = add_job(&mut *tx, &payload, &spec, self.clock.now()).await?;
        tx.commit().await?;

        if job.is_some() {
            self.signals.notify(payload.job_type());
        }
        Ok(job)
    }

    /// Adds a job inside the caller's transaction, so it is recorded if and only if
    /// the caller's own writes are. Call [`WorkerUtils::notify`] after committing.
    pub async fn add_job_in_transaction(
        &self,
        conn: &mut SqliteConnection,
        payload: &JobPayload,
        spec: &JobSpec,
    ) -> Result<Option<Job>> {
        add_job(conn, payload, spec, self.clock.now()).await
    }

    /// Wakes the runner of `job_type`.
    pub fn notify(&self, job_type: JobType) {
        self.signals.notify(job_type);
    }

    /// Queues one decrypt job per envelope. An envelope already queued is skipped.
    pub async fn enqueue_envelopes(&self, envelopes: &[Envelope]) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let mut jobs = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let spec = JobSpec::builder()
                .job_key(format!("decrypt_incoming:{}", envelope.id))
                .build();
            let payload = JobPayload::DecryptIncoming(DecryptIncoming {
                envelope: envelope.clone(),
            });
            if let Some(job) = add_job(&mut *tx, &payload, &spec, now).await? {
                jobs.push(job);
            }
        }
        tx.commit().await?;

        if !jobs.is_empty() {
            info!(count = jobs.len(), "Envelopes queued for decryption");
            self.signals.notify(JobType::DecryptIncoming);
        }
        Ok(jobs)
    }

    /// Stores an outgoing message and queues its send job in one transaction.
    pub async fn enqueue_outgoing(&self, message: SendOutgoing) -> Result<Option<Job>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        insert_message(
            &mut *tx,
            &NewMessage {
                id: message.message_id.clone(),
                conversation_id: message.conversation_id.clone(),
                direction: MessageDirection::Outgoing,
                body: message.body.clone(),
                created_at: now,
            },
        )
        .await?;
        let spec = JobSpec::builder()
            .job_key(format!("send_outgoing:{}", message.message_id))
            .build();
        let job = add_job(&mut *tx, &JobPayload::SendOutgoing(message), &spec, now).await?;
        tx.commit().await?;

        if job.is_some() {
            self.signals.notify(JobType::SendOutgoing);
        }
        Ok(job)
    }

    /// Cancels a job. A job that is running stops at its next cancellation check.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let cancelled = cancel_job(&self.pool, job_id, self.clock.now()).await?;
        if cancelled {
            info!(job_id, "Job cancelled");
        }
        Ok(cancelled)
    }

    /// Cancels every pending or running job of one lane.
    pub async fn cancel_partition(&self, job_type: JobType, partition_key: &str) -> Result<u64> {
        let cancelled =
            cancel_partition(&self.pool, job_type, partition_key, self.clock.now()).await?;
        info!(job_type = %job_type, partition = partition_key, cancelled, "Partition cancelled");
        Ok(cancelled)
    }

    /// Deletes `failed` and `done` records, all of them when `job_ids` is `None`.
    pub async fn purge_jobs(&self, job_ids: Option<&[String]>) -> Result<u64> {
        purge_jobs(&self.pool, job_ids).await
    }

    /// Releases the jobs locked by workers that died without cleaning up, so other
    /// workers can pick them up.
    pub async fn force_unlock_workers(&self, worker_ids: &[String]) -> Result<u64> {
        force_unlock_workers(&self.pool, worker_ids, self.clock.now()).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        get_job_by_id(&self.pool, job_id).await
    }

    /// Number of records per job type and state.
    pub async fn job_counts(&self) -> Result<Vec<QueueCount>> {
        job_counts(&self.pool).await
    }

    pub fn message_finder(&self) -> MessageFinder {
        MessageFinder::new(self.pool.clone(), self.clock.clone())
    }

    /// Runs database migrations to ensure the schema is up to date.
    ///
    /// Automatically called when initializing a worker, but can
    /// also be called manually if needed.
    pub async fn migrate(&self) -> std::result::Result<(), MigrateError> {
        migrate(&self.pool).await
    }
}
