use serde::{Deserialize, Serialize};

/// A raw inbound envelope as delivered by the transport. `content` is ciphertext.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Server-assigned identifier, used to deduplicate re-deliveries.
    pub id: String,
    pub source: String,
    pub source_device: u32,
    /// Sender timestamp, unix millis.
    pub timestamp: i64,
    pub content: Vec<u8>,
}

/// Decrypted envelope content, already classified by the session cipher.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    /// A regular message to be stored in a conversation.
    Data {
        conversation_id: String,
        body: String,
    },
    /// The sender changed the conversation's disappearing-message timer.
    /// `duration_ms: None` disables it.
    ExpirationTimerUpdate {
        conversation_id: String,
        duration_ms: Option<u64>,
    },
    GroupSync {
        data: Vec<u8>,
    },
    ContactSync {
        data: Vec<u8>,
        is_complete: bool,
    },
    /// Receipts, typing indicators, null messages: nothing to persist.
    Empty,
}

/// Where an uploaded attachment can be fetched from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPointer {
    pub attachment_id: String,
    pub cdn_key: String,
}

/// One message of a media broadcast.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub recipient: String,
    pub body: String,
}
