use courier_job::JobDecodeError;
use thiserror::Error;

/// Errors that can occur while talking to the job store.
#[derive(Error, Debug)]
pub enum CourierError {
    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    SqlError(#[from] sqlx::Error),

    /// An error occurred while serializing or deserializing JSON data
    #[error("Error while serializing payload: {0}")]
    JsonSerializeError(#[from] serde_json::Error),

    /// A stored job record could not be decoded
    #[error("Error while decoding job: {0}")]
    JobDecodeError(#[from] JobDecodeError),

    /// Disappearing messages need a strictly positive duration
    #[error("Invalid disappearing messages duration for conversation '{0}': it must be positive")]
    InvalidExpirationDuration(String),
}

impl CourierError {
    /// Store and lock errors go away on their own, decoding errors never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, CourierError::SqlError(_))
    }
}

/// A Result type alias for CourierError.
pub type Result<T> = core::result::Result<T, CourierError>;

/// The error a job body returns. Its variant decides what happens to the record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Transient failure, the job is retried after a backoff
    #[error("{0}")]
    Retryable(String),
    /// The job can never succeed, it is marked failed and reported
    #[error("{0}")]
    Terminal(String),
    /// The work is no longer relevant, the job is dropped silently
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        JobError::Terminal(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        JobError::Cancelled(message.into())
    }
}

impl From<CourierError> for JobError {
    fn from(error: CourierError) -> Self {
        if error.is_transient() {
            JobError::Retryable(error.to_string())
        } else {
            JobError::Terminal(error.to_string())
        }
    }
}
