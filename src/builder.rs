use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use courier_clock::{sub_duration, Clock, SystemClock};
use courier_job::JobType;
use courier_migrations::migrate;
use courier_shutdown_signal::shutdown_signal;
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::backoff::RetryPolicy;
use crate::batch_processor::BatchMessageProcessor;
use crate::collaborators::{
    AttachmentUploader, Collaborators, Reporter, SessionCipher, SyncProcessor, TracingReporter,
    Transport,
};
use crate::disappearing::ExpirationScheduler;
use crate::sql::recover_jobs::release_orphaned_jobs;
use crate::streams::JobSignals;
use crate::Worker;

/// Per job type tuning of a queue runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Jobs of this type run at the same time. Jobs of one partition never do.
    pub concurrency: usize,
    /// Records fetched per round trip
    pub batch_size: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            concurrency: 1,
            batch_size: 10,
        }
    }
}

/// Configuration of a [`Worker`].
///
/// Only the storage and the collaborators are required, every other option has a
/// default.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use courier::{Worker, collaborators::*};
/// # async fn example(
/// #     transport: Arc<dyn Transport>,
/// #     cipher: Arc<dyn SessionCipher>,
/// #     sync: Arc<dyn SyncProcessor>,
/// #     uploader: Arc<dyn AttachmentUploader>,
/// # ) -> Result<(), Box<dyn std::error::Error>> {
/// let worker = Worker::options()
///     .database_url("sqlite://courier.db")
///     .poll_interval(Duration::from_millis(500))
///     .transport(transport)
///     .cipher(cipher)
///     .sync_processor(sync)
///     .uploader(uploader)
///     .init()
///     .await?;
///
/// worker.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct WorkerOptions {
    /// SQLite connection pool
    pool: Option<SqlitePool>,

    /// SQLite connection string
    database_url: Option<String>,

    /// Maximum number of database connections in the pool
    max_connections: Option<u32>,

    /// Longest idle wait of a queue runner
    poll_interval: Option<Duration>,

    batch_size: Option<usize>,

    concurrency: Option<usize>,

    queues: HashMap<JobType, QueueOptions>,

    /// Job types this worker runs, all of them by default
    job_types: Option<Vec<JobType>>,

    retry_policy: Option<RetryPolicy>,

    /// Delay before a job waiting on its dependencies is looked at again
    dependency_poll_interval: Option<Duration>,

    /// Grace period of in-flight job bodies once shutdown is requested
    shutdown_timeout: Option<Duration>,

    /// Age after which the lock of a running job is considered abandoned
    job_expiry: Option<Duration>,

    /// Longest sleep of the expiration timer
    expiration_fallback_interval: Option<Duration>,

    keep_completed_jobs: bool,

    listen_os_shutdown_signals: Option<bool>,

    clock: Option<Arc<dyn Clock>>,
    transport: Option<Arc<dyn Transport>>,
    cipher: Option<Arc<dyn SessionCipher>>,
    sync_processor: Option<Arc<dyn SyncProcessor>>,
    uploader: Option<Arc<dyn AttachmentUploader>>,
    reporter: Option<Arc<dyn Reporter>>,
}

/// Errors that can occur when initializing a worker.
#[derive(Error, Debug)]
pub enum WorkerBuildError {
    /// Failed to connect to the SQLite database
    #[error("Error occurred while connecting to the SQLite database: {0}")]
    ConnectError(#[from] sqlx::Error),

    /// Failed while executing a database query
    #[error("Error occurred while executing a query: {0}")]
    QueryError(#[from] crate::errors::CourierError),

    /// The database URL was not provided and no pool was supplied
    #[error("Missing database_url configuration - must provide either database_url or pool")]
    MissingDatabaseUrl,

    /// A collaborator job bodies need was not provided
    #[error("Missing collaborator '{0}'")]
    MissingCollaborator(&'static str),

    /// Failed to apply database migrations
    #[error("Error occurred while migrating the database schema: {0}")]
    MigrationError(#[from] courier_migrations::MigrateError),
}

impl WorkerOptions {
    /// Initializes a worker with the configured options.
    ///
    /// Process:
    /// 1. Opens the database (using the provided pool or creating one from the URL)
    /// 2. Runs database migrations
    /// 3. Releases the records a crashed worker left `running` (their lock is older
    ///    than `job_expiry`)
    /// 4. Loads the pending message expirations
    pub async fn init(self) -> Result<Worker, WorkerBuildError> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => {
                let db_url = self
                    .database_url
                    .ok_or(WorkerBuildError::MissingDatabaseUrl)?;

                let connect_options = SqliteConnectOptions::from_str(&db_url)?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(5))
                    .foreign_keys(true);

                SqlitePoolOptions::new()
                    .max_connections(self.max_connections.unwrap_or(4))
                    .connect_with(connect_options)
                    .await?
            }
        };

        migrate(&pool).await?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let job_expiry = self.job_expiry.unwrap_or(Duration::from_secs(60));
        let now = clock.now();
        let released = release_orphaned_jobs(&pool, sub_duration(now, job_expiry), now).await?;
        if released > 0 {
            warn!(released, "Released jobs left running by a previous worker");
        }

        let collaborators = Collaborators {
            transport: self
                .transport
                .ok_or(WorkerBuildError::MissingCollaborator("transport"))?,
            cipher: self
                .cipher
                .ok_or(WorkerBuildError::MissingCollaborator("cipher"))?,
            sync: self
                .sync_processor
                .ok_or(WorkerBuildError::MissingCollaborator("sync_processor"))?,
            uploader: self
                .uploader
                .ok_or(WorkerBuildError::MissingCollaborator("uploader"))?,
        };
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(TracingReporter));

        let signals = JobSignals::new();
        let expirations = ExpirationScheduler::new(
            pool.clone(),
            clock.clone(),
            reporter.clone(),
            self.expiration_fallback_interval
                .unwrap_or(Duration::from_secs(60)),
        );
        expirations.load_pending().await?;

        let batch_processor = BatchMessageProcessor::new(
            pool.clone(),
            collaborators.cipher.clone(),
            clock.clone(),
            signals.clone(),
        );

        let defaults = QueueOptions {
            concurrency: self.concurrency.unwrap_or(1),
            batch_size: self.batch_size.unwrap_or(10),
        };
        let queues = self
            .job_types
            .unwrap_or_else(|| JobType::ALL.to_vec())
            .into_iter()
            .map(|job_type| {
                let options = self.queues.get(&job_type).copied().unwrap_or(defaults);
                (job_type, options)
            })
            .collect();

        let mut random_bytes = [0u8; 9];
        rand::rng().fill_bytes(&mut random_bytes);
        let worker_id = format!("courier_worker_{}", hex::encode(random_bytes));

        let (shutdown_signal, shutdown_handle) =
            shutdown_signal(self.listen_os_shutdown_signals.unwrap_or(true));

        info!(worker_id, "Worker initialized");

        Ok(Worker {
            worker_id,
            pool,
            clock,
            signals,
            queues,
            poll_interval: self.poll_interval.unwrap_or(Duration::from_millis(1000)),
            retry_policy: self.retry_policy.unwrap_or_default(),
            dependency_poll_interval: self
                .dependency_poll_interval
                .unwrap_or(Duration::from_secs(1)),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(Duration::from_secs(5)),
            job_expiry,
            store_retry_delay: Duration::from_millis(100),
            keep_completed_jobs: self.keep_completed_jobs,
            collaborators,
            reporter,
            expirations,
            batch_processor,
            shutdown_signal,
            shutdown_handle,
        })
    }

    /// Sets an existing SQLite connection pool for the worker to use.
    ///
    /// # Note
    /// If both `pool` and `database_url` are provided, `pool` takes precedence.
    pub fn pool(mut self, value: SqlitePool) -> Self {
        self.pool = Some(value);
        self
    }

    /// Sets the SQLite connection URL, e.g. `sqlite://courier.db`. The file is
    /// created when missing.
    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }

    /// Sets the maximum number of database connections in the pool.
    ///
    /// # Default
    /// If not specified, defaults to 4 connections.
    pub fn max_connections(mut self, value: u32) -> Self {
        self.max_connections = Some(value);
        self
    }

    /// Sets the longest time a queue runner waits before looking at its queue
    /// again when no notification arrived.
    ///
    /// # Default
    /// If not specified, defaults to 1000 milliseconds (1 second).
    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = Some(value);
        self
    }

    /// Sets how many records a queue runner fetches at once.
    ///
    /// # Panics
    /// Panics if the value is 0.
    pub fn batch_size(mut self, value: usize) -> Self {
        assert!(value > 0, "Batch size must be greater than 0");
        self.batch_size = Some(value);
        self
    }

    /// Sets how many jobs of one type run at the same time.
    ///
    /// # Default
    /// If not specified, defaults to 1: every queue runs its jobs serially.
    ///
    /// # Panics
    /// Panics if the value is 0, as at least one job must be processable.
    pub fn concurrency(mut self, value: usize) -> Self {
        assert!(value > 0, "Concurrency must be greater than 0");
        self.concurrency = Some(value);
        self
    }

    /// Overrides concurrency and batch size for one job type.
    ///
    /// # Panics
    /// Panics if either value is 0.
    pub fn queue(mut self, job_type: JobType, options: QueueOptions) -> Self {
        assert!(options.concurrency > 0, "Concurrency must be greater than 0");
        assert!(options.batch_size > 0, "Batch size must be greater than 0");
        self.queues.insert(job_type, options);
        self
    }

    /// Restricts the worker to some job types. The others stay in the store for
    /// another worker.
    pub fn job_types(mut self, value: impl IntoIterator<Item = JobType>) -> Self {
        self.job_types = Some(value.into_iter().collect());
        self
    }

    pub fn retry_policy(mut self, value: RetryPolicy) -> Self {
        self.retry_policy = Some(value);
        self
    }

    pub fn dependency_poll_interval(mut self, value: Duration) -> Self {
        self.dependency_poll_interval = Some(value);
        self
    }

    /// Sets how long in-flight job bodies may keep running once shutdown is
    /// requested. They are aborted afterwards and retried later.
    ///
    /// # Default
    /// If not specified, defaults to 5 seconds.
    pub fn shutdown_timeout(mut self, value: Duration) -> Self {
        self.shutdown_timeout = Some(value);
        self
    }

    /// Sets how old the lock of a `running` job must be before a starting worker
    /// treats it as left behind by a dead worker and runs the job again.
    ///
    /// Running jobs refresh their lock every quarter of this duration, so a job
    /// held by a live worker is never taken over, however long it runs.
    ///
    /// # Default
    /// If not specified, defaults to 60 seconds.
    ///
    /// # Panics
    /// Panics if the value is zero.
    pub fn job_expiry(mut self, value: Duration) -> Self {
        assert!(!value.is_zero(), "Job expiry must be greater than 0");
        self.job_expiry = Some(value);
        self
    }

    /// Sets the longest sleep of the expiration timer, whatever the next deadline.
    ///
    /// # Default
    /// If not specified, defaults to 60 seconds.
    pub fn expiration_fallback_interval(mut self, value: Duration) -> Self {
        self.expiration_fallback_interval = Some(value);
        self
    }

    /// Keeps completed records as `done` instead of deleting them.
    pub fn keep_completed_jobs(mut self, value: bool) -> Self {
        self.keep_completed_jobs = value;
        self
    }

    /// Whether SIGINT/SIGTERM (ctrl-c on windows) shut the worker down.
    ///
    /// # Default
    /// If not specified, defaults to true.
    pub fn listen_os_shutdown_signals(mut self, value: bool) -> Self {
        self.listen_os_shutdown_signals = Some(value);
        self
    }

    /// Sets the time source. Tests pass a `MockClock`.
    pub fn clock(mut self, value: Arc<dyn Clock>) -> Self {
        self.clock = Some(value);
        self
    }

    pub fn transport(mut self, value: Arc<dyn Transport>) -> Self {
        self.transport = Some(value);
        self
    }

    pub fn cipher(mut self, value: Arc<dyn SessionCipher>) -> Self {
        self.cipher = Some(value);
        self
    }

    pub fn sync_processor(mut self, value: Arc<dyn SyncProcessor>) -> Self {
        self.sync_processor = Some(value);
        self
    }

    pub fn uploader(mut self, value: Arc<dyn AttachmentUploader>) -> Self {
        self.uploader = Some(value);
        self
    }

    /// Sets where permanent failures and expirations are reported.
    ///
    /// # Default
    /// If not specified, they are logged with `tracing`.
    pub fn reporter(mut self, value: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(value);
        self
    }
}
