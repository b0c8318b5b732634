use std::fmt::{Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

/// Persisted lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Waiting for its `run_at` and for the head of its partition.
    Ready,
    /// Claimed by a worker, identified by `locked_by`.
    Running,
    /// Failed with a retryable error, eligible again at `run_at`.
    Retrying,
    /// Terminal. Never becomes `Ready` again.
    Failed,
    /// Completed and retained for diagnostics.
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Retrying => "retrying",
            JobState::Failed => "failed",
            JobState::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Done)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown job state '{0}'")]
pub struct ParseJobStateError(pub String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(JobState::Ready),
            "running" => Ok(JobState::Running),
            "retrying" => Ok(JobState::Retrying),
            "failed" => Ok(JobState::Failed),
            "done" => Ok(JobState::Done),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}
