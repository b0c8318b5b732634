use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use courier_clock::{add_duration, Clock};
use courier_job::{Job, JobType};
use courier_shutdown_signal::{ShutdownHandle, ShutdownSignal};
use futures::{future::join_all, join, stream, FutureExt, StreamExt};
use getset::Getters;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use crate::backoff::RetryPolicy;
use crate::batch_processor::BatchMessageProcessor;
use crate::builder::{QueueOptions, WorkerOptions};
use crate::collaborators::{Collaborators, JobFailure, Reporter};
use crate::context::JobContext;
use crate::disappearing::{ExpirationScheduler, MessageFinder};
use crate::errors::{CourierError, JobError};
use crate::jobs::run_job_body;
use crate::operation::{check_dependencies, DependencyCheck, JobErrorClassifier, Operation, Outcome};
use crate::sql::cancel_job::discard_cancelled_jobs;
use crate::sql::complete_job::{complete_job, discard_job};
use crate::sql::fail_job::{fail_job, fail_unclaimed_job, release_blocked_job, retry_job};
use crate::sql::get_job::{claim_job, defer_job, dependency_states, fetch_ready};
use crate::sql::recover_jobs::refresh_job_lock;
use crate::streams::{job_signal_stream, JobSignals, StreamSource};
use crate::worker_utils::WorkerUtils;

/// Runs one queue per job type plus the expiration scheduler, over one pool.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Worker {
    /// Unique identifier for this worker instance, written in `locked_by`
    pub(crate) worker_id: String,
    pub(crate) pool: SqlitePool,
    pub(crate) clock: Arc<dyn Clock>,
    #[getset(skip)]
    pub(crate) signals: JobSignals,
    /// The job types this worker runs, with their queue options
    pub(crate) queues: Vec<(JobType, QueueOptions)>,
    /// Longest idle wait of a queue runner
    pub(crate) poll_interval: Duration,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) dependency_poll_interval: Duration,
    /// Grace period of in-flight job bodies after shutdown was requested
    pub(crate) shutdown_timeout: Duration,
    /// Age of a lock after which a starting worker takes the job over
    pub(crate) job_expiry: Duration,
    #[getset(skip)]
    pub(crate) store_retry_delay: Duration,
    pub(crate) keep_completed_jobs: bool,
    #[getset(skip)]
    pub(crate) collaborators: Collaborators,
    #[getset(skip)]
    pub(crate) reporter: Arc<dyn Reporter>,
    pub(crate) expirations: ExpirationScheduler,
    pub(crate) batch_processor: BatchMessageProcessor,
    /// Resolves once shutdown was requested, by the OS or by [`Worker::request_shutdown`]
    pub(crate) shutdown_signal: ShutdownSignal,
    #[getset(skip)]
    pub(crate) shutdown_handle: ShutdownHandle,
}

/// Errors that can occur during worker runtime.
#[derive(Error, Debug)]
pub enum WorkerRuntimeError {
    /// An error occurred while processing or releasing a job
    #[error("Unexpected error occured while processing job : '{0}'")]
    ProcessJob(#[from] ProcessJobError),
    /// An error occurred while deleting expired messages
    #[error("Error occured while sweeping expired messages : {0}")]
    Expiration(#[source] CourierError),
}

/// Errors that can occur while processing a job.
#[derive(Error, Debug)]
pub enum ProcessJobError {
    /// Error occurred when trying to complete or fail a job after processing
    #[error("An error occured while releasing a job : '{0}'")]
    ReleaseJobError(#[from] ReleaseJobError),
    /// Error occurred when trying to fetch or claim a job
    #[error("An error occured while fetching a job to run : '{0}'")]
    GetJobError(#[from] CourierError),
}

impl From<sqlx::Error> for ProcessJobError {
    fn from(error: sqlx::Error) -> Self {
        ProcessJobError::GetJobError(CourierError::from(error))
    }
}

/// Error that occurs when trying to persist the outcome of a job.
#[derive(Error, Debug)]
#[error("Failed to release job '{job_id}'. {source}")]
pub struct ReleaseJobError {
    /// The ID of the job that could not be released
    job_id: String,
    /// The underlying error that caused the release operation to fail
    #[source]
    source: CourierError,
}

impl Worker {
    /// Creates a new `WorkerOptions` builder with default settings.
    pub fn options() -> WorkerOptions {
        WorkerOptions::default()
    }

    /// Runs every queue and the expiration scheduler until the shutdown signal
    /// resolves.
    ///
    /// In-flight job bodies get `shutdown_timeout` to finish, they are aborted
    /// afterwards and retried by the next worker.
    pub async fn run(&self) -> Result<(), WorkerRuntimeError> {
        info!(worker_id = %self.worker_id, queues = self.queues.len(), "Worker started");

        let queue_runners = join_all(
            self.queues
                .iter()
                .map(|(job_type, options)| self.queue_runner(*job_type, *options)),
        );
        let expiration_scheduler = self.expirations.run(self.shutdown_signal.clone());

        join!(queue_runners, expiration_scheduler);

        info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    /// Processes every job that is runnable right now, in every queue, then
    /// deletes the messages whose deadline passed, and returns.
    ///
    /// Passes over the queues repeat until one finds nothing to do, so jobs created
    /// or woken up by other jobs run in the same call.
    pub async fn run_once(&self) -> Result<(), WorkerRuntimeError> {
        loop {
            if self.is_shutting_down() {
                return Ok(());
            }

            let mut processed = 0;
            for (job_type, options) in &self.queues {
                processed += self.process_queue_pass(*job_type, *options).await?;
            }
            if processed == 0 {
                break;
            }
        }

        self.expirations
            .sweep()
            .await
            .map_err(WorkerRuntimeError::Expiration)?;

        Ok(())
    }

    /// Creates a utils object sharing this worker's pool, clock and notifications.
    pub fn create_utils(&self) -> WorkerUtils {
        WorkerUtils::new(self.pool.clone())
            .with_clock(self.clock.clone())
            .with_signals(self.signals.clone())
    }

    pub fn message_finder(&self) -> MessageFinder {
        MessageFinder::new(self.pool.clone(), self.clock.clone())
    }

    /// Requests a graceful shutdown of the worker.
    ///
    /// `run`/`run_once` return once in-flight work has finished.
    pub fn request_shutdown(&self) {
        self.shutdown_handle.request_shutdown();
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_signal.clone().now_or_never().is_some()
    }

    async fn queue_runner(&self, job_type: JobType, options: QueueOptions) {
        let job_signal = job_signal_stream(
            job_type,
            self.pool.clone(),
            self.clock.clone(),
            &self.signals,
            self.poll_interval,
            self.shutdown_signal.clone(),
        );

        debug!(job_type = %job_type, "Listening for jobs...");
        job_signal
            .for_each(|source| self.drain_queue(job_type, options, source))
            .await;
        debug!(job_type = %job_type, "Queue runner stopped");
    }

    /// Runs passes over one queue until a pass finds nothing. Store errors fail the
    /// current pass only, it is retried after a doubling delay.
    async fn drain_queue(&self, job_type: JobType, options: QueueOptions, source: StreamSource) {
        let mut retry_delay = self.store_retry_delay;

        while !self.is_shutting_down() {
            match self.process_queue_pass(job_type, options).await {
                Ok(0) => {
                    trace!(job_type = %job_type, source = ?source, "No job found");
                    return;
                }
                Ok(_) => retry_delay = self.store_retry_delay,
                Err(e) => {
                    error!(job_type = %job_type, error = %e, ?retry_delay, "Error while processing queue");
                    tokio::select! {
                        _ = tokio::time::sleep(retry_delay) => {},
                        _ = self.shutdown_signal.clone() => return,
                    }
                    retry_delay = (retry_delay * 2).min(self.poll_interval.max(self.store_retry_delay));
                }
            }
        }
    }

    /// Fetches one batch of partition heads and processes it. Returns how many
    /// records were looked at.
    async fn process_queue_pass(
        &self,
        job_type: JobType,
        options: QueueOptions,
    ) -> Result<usize, ProcessJobError> {
        let discarded = discard_cancelled_jobs(&self.pool, job_type).await?;
        if discarded > 0 {
            debug!(job_type = %job_type, discarded, "Discarded cancelled jobs");
        }

        let ready = fetch_ready(&self.pool, job_type, options.batch_size, self.clock.now()).await?;
        let processed = ready.undecodable.len() + ready.jobs.len();

        for (job_id, error) in ready.undecodable {
            self.fail_undecodable(job_type, &job_id, &error).await?;
        }

        let results: Vec<Result<(), ProcessJobError>> = stream::iter(ready.jobs)
            .map(|job| self.process_job(job))
            .buffer_unordered(options.concurrency)
            .collect()
            .await;

        results.into_iter().collect::<Result<Vec<()>, _>>()?;

        Ok(processed)
    }

    async fn fail_undecodable(
        &self,
        job_type: JobType,
        job_id: &str,
        error: &str,
    ) -> Result<(), ProcessJobError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let (failed, woken) = fail_unclaimed_job(&mut *tx, job_id, error, now).await?;
        tx.commit().await?;

        if failed {
            self.reporter.job_failed(&JobFailure {
                job_id: job_id.to_string(),
                job_type,
                partition_key: String::new(),
                attempts: 0,
                error: error.to_string(),
                exhausted: false,
            });
        }
        self.signals.notify_all(woken);
        Ok(())
    }

    /// Checks the dependencies of a record, claims it, runs it and persists the
    /// outcome.
    async fn process_job(&self, job: Job) -> Result<(), ProcessJobError> {
        let now = self.clock.now();
        let dependencies = dependency_states(&self.pool, job.id()).await?;

        match check_dependencies(&dependencies) {
            DependencyCheck::Met => {}
            DependencyCheck::Unmet => {
                let deferred_until = add_duration(now, self.dependency_poll_interval);
                defer_job(&self.pool, job.id(), deferred_until, now).await?;
                debug!(job_id = %job.id(), %deferred_until, "Job waiting on its dependencies");
                return Ok(());
            }
            DependencyCheck::Failed(dependency) => {
                let error = format!("dependency '{dependency}' failed");
                let mut tx = self.pool.begin().await?;
                let (failed, woken) = fail_unclaimed_job(&mut *tx, job.id(), &error, now).await?;
                tx.commit().await?;

                if failed {
                    error!(job_id = %job.id(), dependency = %dependency, "Job dependency failed");
                    self.reporter.job_failed(&JobFailure {
                        job_id: job.id().clone(),
                        job_type: job.job_type(),
                        partition_key: job.partition_key().clone(),
                        attempts: *job.attempts(),
                        error,
                        exhausted: false,
                    });
                }
                self.signals.notify_all(woken);
                return Ok(());
            }
        }

        let Some(claimed) = claim_job(&self.pool, job.id(), &self.worker_id, self.clock.now()).await?
        else {
            trace!(job_id = %job.id(), "Job was claimed by someone else");
            return Ok(());
        };
        let claimed = Arc::new(claimed);

        let mut operation = Operation::new(
            claimed.id().clone(),
            *claimed.attempts(),
            *claimed.max_attempts(),
            || self.run_job(claimed.clone()),
            JobErrorClassifier,
            self.retry_policy,
        )
        .with_dependencies(dependencies);
        let outcome = operation.run(self.clock.as_ref()).await;

        let mut retry_delay = self.store_retry_delay;
        loop {
            match self.release_job(&claimed, &outcome).await {
                Ok(()) => return Ok(()),
                Err(e) if self.is_shutting_down() => return Err(e.into()),
                Err(e) => {
                    error!(error = %e, ?retry_delay, "Release job error");
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = (retry_delay * 2).min(self.poll_interval.max(self.store_retry_delay));
                }
            }
        }
    }

    /// Runs the body of a claimed job on its own task, refreshing the job lock
    /// while it runs.
    ///
    /// Once shutdown is requested the body gets `shutdown_timeout` to finish before
    /// it is aborted. The body is aborted too when the lock is lost, e.g. to
    /// `force_unlock_workers`. A panic or an abort is a retryable failure.
    #[tracing::instrument(
        "run_job",
        skip(self, job),
        fields(
            job_id = %job.id(),
            job_type = %job.job_type(),
            partition = %job.partition_key(),
            attempts = *job.attempts(),
        )
    )]
    async fn run_job(&self, job: Arc<Job>) -> Result<(), JobError> {
        let ctx = JobContext::new(
            job.clone(),
            self.worker_id.clone(),
            self.pool.clone(),
            self.clock.clone(),
            self.collaborators.clone(),
            self.expirations.clone(),
            self.batch_processor.clone(),
            self.signals.clone(),
        );

        let start = Instant::now();
        let job_task = tokio::spawn(run_job_body(ctx).instrument(Span::current()));
        let abort_handle = job_task.abort_handle();

        let shutdown_signal = self.shutdown_signal.clone();
        let shutdown_timeout = async {
            shutdown_signal.await;
            tokio::time::sleep(self.shutdown_timeout).await;
        };
        let lock_lost = self.keep_job_locked(&job);

        let result = tokio::select! {
            res = job_task => match res {
                Ok(result) => result,
                Err(e) => Err(JobError::retryable(format!("job body did not complete: {e}"))),
            },
            _ = shutdown_timeout => {
                abort_handle.abort();
                warn!(
                    job_id = %job.id(),
                    timeout = ?self.shutdown_timeout,
                    "Job interrupted by shutdown signal"
                );
                Err(JobError::retryable("interrupted by shutdown"))
            }
            _ = lock_lost => {
                abort_handle.abort();
                warn!(job_id = %job.id(), "Job lock lost, stopped the job");
                Err(JobError::retryable("job lock was lost"))
            }
        };

        let duration = start.elapsed();
        match &result {
            Ok(()) => info!(
                job_id = %job.id(),
                duration = duration.as_millis(),
                "Completed job with success"
            ),
            Err(e) => debug!(job_id = %job.id(), error = %e, "Job body failed"),
        }

        result
    }

    /// Refreshes the lock of a running job every quarter of `job_expiry`. Resolves
    /// once the lock belongs to this worker no more.
    async fn keep_job_locked(&self, job: &Job) {
        let interval = self.job_expiry / 4;
        loop {
            tokio::time::sleep(interval).await;
            match refresh_job_lock(&self.pool, job.id(), &self.worker_id, self.clock.now()).await {
                Ok(true) => trace!(job_id = %job.id(), "Job lock refreshed"),
                Ok(false) => return,
                Err(e) => warn!(job_id = %job.id(), error = %e, "Could not refresh job lock"),
            }
        }
    }

    /// Deletes a claimed job that was cancelled while it ran.
    async fn discard_cancelled(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobType>, CourierError> {
        let mut tx = self.pool.begin().await?;
        let woken = discard_job(&mut *tx, job.id(), &self.worker_id, now).await?;
        tx.commit().await?;
        info!(job_id = %job.id(), "Job cancelled while running, discarded");
        Ok(woken)
    }

    /// Persists the outcome of an operation and wakes the queues it made runnable.
    async fn release_job(&self, job: &Job, outcome: &Outcome) -> Result<(), ReleaseJobError> {
        let release_error = |source: CourierError| ReleaseJobError {
            job_id: job.id().clone(),
            source,
        };
        let now = self.clock.now();

        let woken = match outcome {
            Outcome::Succeeded => {
                let mut tx = self.pool.begin().await.map_err(|e| release_error(e.into()))?;
                let woken = complete_job(
                    &mut *tx,
                    job,
                    &self.worker_id,
                    self.keep_completed_jobs,
                    now,
                )
                .await
                .map_err(release_error)?;
                tx.commit().await.map_err(|e| release_error(e.into()))?;
                woken
            }
            Outcome::Retry { run_at, error } => {
                let retried = retry_job(&self.pool, job, &self.worker_id, error, *run_at, now)
                    .await
                    .map_err(release_error)?;
                if retried {
                    warn!(
                        job_id = %job.id(),
                        job_type = %job.job_type(),
                        attempts = *job.attempts(),
                        error = %error,
                        %run_at,
                        "Failed job, will retry"
                    );
                    Vec::new()
                } else {
                    self.discard_cancelled(job, now).await.map_err(release_error)?
                }
            }
            Outcome::Failed { error, exhausted } => {
                let mut tx = self.pool.begin().await.map_err(|e| release_error(e.into()))?;
                let failed = fail_job(&mut *tx, job, &self.worker_id, error, now)
                    .await
                    .map_err(release_error)?;
                let Some(woken) = failed else {
                    // Cancelled while running: dropped without a report.
                    let woken = discard_job(&mut *tx, job.id(), &self.worker_id, now)
                        .await
                        .map_err(release_error)?;
                    tx.commit().await.map_err(|e| release_error(e.into()))?;
                    info!(
                        job_id = %job.id(),
                        error = %error,
                        "Job cancelled while running, discarded"
                    );
                    self.signals.notify_all(woken);
                    return Ok(());
                };
                tx.commit().await.map_err(|e| release_error(e.into()))?;

                error!(
                    job_id = %job.id(),
                    job_type = %job.job_type(),
                    attempts = *job.attempts(),
                    exhausted,
                    error = %error,
                    "Job failed permanently"
                );
                self.reporter.job_failed(&JobFailure {
                    job_id: job.id().clone(),
                    job_type: job.job_type(),
                    partition_key: job.partition_key().clone(),
                    attempts: *job.attempts(),
                    error: error.clone(),
                    exhausted: *exhausted,
                });
                woken
            }
            Outcome::Discarded { reason } => {
                let mut tx = self.pool.begin().await.map_err(|e| release_error(e.into()))?;
                let woken = discard_job(&mut *tx, job.id(), &self.worker_id, now)
                    .await
                    .map_err(release_error)?;
                tx.commit().await.map_err(|e| release_error(e.into()))?;
                info!(job_id = %job.id(), reason = %reason, "Job discarded");
                woken
            }
            Outcome::Blocked => {
                let deferred_until = add_duration(now, self.dependency_poll_interval);
                release_blocked_job(&self.pool, job, &self.worker_id, deferred_until, now)
                    .await
                    .map_err(release_error)?;
                debug!(job_id = %job.id(), %deferred_until, "Job waiting on its dependencies");
                Vec::new()
            }
        };

        self.signals.notify_all(woken);
        Ok(())
    }
}
