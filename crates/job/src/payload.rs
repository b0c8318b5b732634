use serde::{Deserialize, Serialize};

use crate::content::{AttachmentPointer, Content, Envelope, OutgoingMessage};
use crate::job_type::JobType;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DecryptIncoming {
    pub envelope: Envelope,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub envelope_id: String,
    pub source: String,
    pub timestamp: i64,
    pub content: Content,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IncomingGroupSync {
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IncomingContactSync {
    pub data: Vec<u8>,
    pub is_complete: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionReset {
    pub recipient: String,
    pub conversation_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SendOutgoing {
    pub message_id: String,
    pub conversation_id: String,
    pub recipient: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentPointer>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMedia {
    pub attachment_ids: Vec<String>,
    pub messages: Vec<OutgoingMessage>,
}

/// The closed set of job payloads. Adding a job kind means adding a variant here,
/// and the compiler then points at every `match` that must handle it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    DecryptIncoming(DecryptIncoming),
    MessageContent(MessageContent),
    IncomingGroupSync(IncomingGroupSync),
    IncomingContactSync(IncomingContactSync),
    SessionReset(SessionReset),
    SendOutgoing(SendOutgoing),
    BroadcastMedia(BroadcastMedia),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::DecryptIncoming(_) => JobType::DecryptIncoming,
            JobPayload::MessageContent(_) => JobType::MessageContent,
            JobPayload::IncomingGroupSync(_) => JobType::IncomingGroupSync,
            JobPayload::IncomingContactSync(_) => JobType::IncomingContactSync,
            JobPayload::SessionReset(_) => JobType::SessionReset,
            JobPayload::SendOutgoing(_) => JobType::SendOutgoing,
            JobPayload::BroadcastMedia(_) => JobType::BroadcastMedia,
        }
    }

    /// The serial lane this job runs in, within its job type.
    /// An empty key puts the job in the single lane shared by the whole job type.
    pub fn partition_key(&self) -> String {
        match self {
            JobPayload::DecryptIncoming(p) => p.envelope.source.clone(),
            JobPayload::MessageContent(p) => match &p.content {
                Content::Data {
                    conversation_id, ..
                }
                | Content::ExpirationTimerUpdate {
                    conversation_id, ..
                } => conversation_id.clone(),
                Content::GroupSync { .. } | Content::ContactSync { .. } | Content::Empty => {
                    p.source.clone()
                }
            },
            JobPayload::IncomingGroupSync(_)
            | JobPayload::IncomingContactSync(_)
            | JobPayload::BroadcastMedia(_) => String::new(),
            JobPayload::SessionReset(p) => p.recipient.clone(),
            JobPayload::SendOutgoing(p) => p.recipient.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(source: &str) -> Envelope {
        Envelope {
            id: "env-1".into(),
            source: source.into(),
            source_device: 1,
            timestamp: 1_700_000_000_000,
            content: vec![1, 2, 3],
        }
    }

    #[test]
    fn payload_is_tagged_with_its_job_type() {
        let payload = JobPayload::DecryptIncoming(DecryptIncoming {
            envelope: envelope("+15550001"),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], payload.job_type().as_str());
        assert_eq!(serde_json::from_value::<JobPayload>(json).unwrap(), payload);
    }

    #[test]
    fn decrypt_jobs_are_partitioned_by_sender() {
        let payload = JobPayload::DecryptIncoming(DecryptIncoming {
            envelope: envelope("+15550001"),
        });
        assert_eq!(payload.partition_key(), "+15550001");
    }

    #[test]
    fn content_jobs_are_partitioned_by_conversation() {
        let payload = JobPayload::MessageContent(MessageContent {
            envelope_id: "env-1".into(),
            source: "+15550001".into(),
            timestamp: 0,
            content: Content::Data {
                conversation_id: "conv-a".into(),
                body: "hi".into(),
            },
        });
        assert_eq!(payload.partition_key(), "conv-a");
    }

    #[test]
    fn sync_jobs_share_a_single_lane() {
        let payload = JobPayload::IncomingContactSync(IncomingContactSync {
            data: vec![],
            is_complete: true,
        });
        assert_eq!(payload.partition_key(), "");
    }
}
