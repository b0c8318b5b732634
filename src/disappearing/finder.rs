use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_clock::{from_millis, Clock};
use getset::Getters;
use sqlx::{FromRow, SqlitePool};

use crate::errors::Result;
use crate::sql::messages::{fetch_visible, get_visible_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Incoming => "incoming",
            MessageDirection::Outgoing => "outgoing",
        }
    }
}

/// A message to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: MessageDirection,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A stored message, as readers see it.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    #[getset(get = "pub")]
    id: String,
    #[getset(get = "pub")]
    conversation_id: String,
    direction: String,
    #[getset(get = "pub")]
    body: String,
    created_at: i64,
    read_at: Option<i64>,
    expire_started_at: Option<i64>,
    expires_at: Option<i64>,
}

impl Message {
    pub fn direction(&self) -> MessageDirection {
        match self.direction.as_str() {
            "outgoing" => MessageDirection::Outgoing,
            _ => MessageDirection::Incoming,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        from_millis(self.created_at)
    }

    pub fn read_at(&self) -> Option<DateTime<Utc>> {
        self.read_at.map(from_millis)
    }

    pub fn expire_started_at(&self) -> Option<DateTime<Utc>> {
        self.expire_started_at.map(from_millis)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at.map(from_millis)
    }
}

/// Read side of the message store. Never returns a message past its deadline,
/// even before the scheduler deleted it.
#[derive(Clone)]
pub struct MessageFinder {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl MessageFinder {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        MessageFinder { pool, clock }
    }

    pub async fn fetch_visible(&self, conversation_id: &str) -> Result<Vec<Message>> {
        fetch_visible(&self.pool, conversation_id, self.clock.now()).await
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<Message>> {
        get_visible_message(&self.pool, message_id, self.clock.now()).await
    }
}
