mod content;
mod job_type;
mod payload;
mod state;

use chrono::{DateTime, Utc};
use courier_clock::from_millis;
use derive_builder::Builder;
use getset::Getters;
use sqlx::FromRow;
use thiserror::Error;

pub use content::{AttachmentPointer, Content, Envelope, OutgoingMessage};
pub use job_type::{JobType, ParseJobTypeError};
pub use payload::{
    BroadcastMedia, DecryptIncoming, IncomingContactSync, IncomingGroupSync, JobPayload,
    MessageContent, SendOutgoing, SessionReset,
};
pub use state::{JobState, ParseJobStateError};

/// Attempts allowed when the job spec does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 25;

/// `DbJob` is a row of the `jobs` table as SQLite returns it: timestamps are unix
/// millis and enums are text. Use [`Job::try_from`] to get the typed record.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct DbJob {
    /// Insertion order, assigned by the store. Defines FIFO order.
    sort_key: i64,
    id: String,
    /// Deduplication key, unique while the record exists.
    job_key: Option<String>,
    job_type: String,
    partition_key: String,
    /// JSON of a [`JobPayload`]
    payload: String,
    state: String,
    /// How many times it has been claimed
    attempts: i32,
    max_attempts: i32,
    run_at: i64,
    /// If attempts > 0, why did it fail last ?
    last_error: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<i64>,
    cancelled: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(Error, Debug)]
pub enum JobDecodeError {
    #[error(transparent)]
    JobType(#[from] ParseJobTypeError),
    #[error(transparent)]
    State(#[from] ParseJobStateError),
    #[error("Invalid payload for job '{job_id}': {source}")]
    Payload {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Job '{job_id}' is stored as '{stored}' but its payload is a '{payload}' job")]
    TypeMismatch {
        job_id: String,
        stored: JobType,
        payload: JobType,
    },
}

/// A persisted unit of deferred work.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Builder)]
#[getset(get = "pub")]
#[builder(build_fn(private, name = "build_internal"), pattern = "owned")]
pub struct Job {
    #[builder(default)]
    sort_key: i64,
    #[builder(default, setter(into))]
    id: String,
    #[builder(default, setter(strip_option, into))]
    job_key: Option<String>,
    #[builder(default, setter(into))]
    partition_key: String,
    payload: JobPayload,
    #[builder(default = "JobState::Ready")]
    state: JobState,
    #[builder(default)]
    attempts: i32,
    #[builder(default = "DEFAULT_MAX_ATTEMPTS")]
    max_attempts: i32,
    #[builder(default = "Utc::now()")]
    run_at: DateTime<Utc>,
    #[builder(default, setter(strip_option, into))]
    last_error: Option<String>,
    #[builder(default, setter(strip_option, into))]
    locked_by: Option<String>,
    #[builder(default, setter(strip_option))]
    locked_at: Option<DateTime<Utc>>,
    #[builder(default)]
    cancelled: bool,
    #[builder(default = "Utc::now()")]
    created_at: DateTime<Utc>,
    #[builder(default = "Utc::now()")]
    updated_at: DateTime<Utc>,
}

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }
}

impl JobBuilder {
    /// Builds the Job. Panics if no payload was given, every other field has a default.
    pub fn build(self) -> Job {
        self.build_internal()
            .expect("A job always needs a payload, every other field has a default")
    }
}

impl TryFrom<DbJob> for Job {
    type Error = JobDecodeError;

    fn try_from(db_job: DbJob) -> Result<Self, Self::Error> {
        let stored: JobType = db_job.job_type.parse()?;
        let payload: JobPayload =
            serde_json::from_str(&db_job.payload).map_err(|source| JobDecodeError::Payload {
                job_id: db_job.id.clone(),
                source,
            })?;
        if payload.job_type() != stored {
            return Err(JobDecodeError::TypeMismatch {
                job_id: db_job.id,
                stored,
                payload: payload.job_type(),
            });
        }

        Ok(Job {
            sort_key: db_job.sort_key,
            id: db_job.id,
            job_key: db_job.job_key,
            partition_key: db_job.partition_key,
            payload,
            state: db_job.state.parse()?,
            attempts: db_job.attempts,
            max_attempts: db_job.max_attempts,
            run_at: from_millis(db_job.run_at),
            last_error: db_job.last_error,
            locked_by: db_job.locked_by,
            locked_at: db_job.locked_at.map(from_millis),
            cancelled: db_job.cancelled,
            created_at: from_millis(db_job.created_at),
            updated_at: from_millis(db_job.updated_at),
        })
    }
}
