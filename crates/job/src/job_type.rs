use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every kind of job the engine knows how to run. Each variant owns one logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DecryptIncoming,
    MessageContent,
    IncomingGroupSync,
    IncomingContactSync,
    SessionReset,
    SendOutgoing,
    BroadcastMedia,
}

impl JobType {
    /// All job types, in the order `run_once` drains their queues.
    pub const ALL: [JobType; 7] = [
        JobType::DecryptIncoming,
        JobType::MessageContent,
        JobType::IncomingGroupSync,
        JobType::IncomingContactSync,
        JobType::SessionReset,
        JobType::SendOutgoing,
        JobType::BroadcastMedia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DecryptIncoming => "decrypt_incoming",
            JobType::MessageContent => "message_content",
            JobType::IncomingGroupSync => "incoming_group_sync",
            JobType::IncomingContactSync => "incoming_contact_sync",
            JobType::SessionReset => "session_reset",
            JobType::SendOutgoing => "send_outgoing",
            JobType::BroadcastMedia => "broadcast_media",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown job type '{0}'")]
pub struct ParseJobTypeError(pub String);

impl FromStr for JobType {
    type Err = ParseJobTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|job_type| job_type.as_str() == s)
            .ok_or_else(|| ParseJobTypeError(s.to_string()))
    }
}
