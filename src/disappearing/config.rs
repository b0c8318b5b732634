use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_clock::from_millis;
use getset::{CopyGetters, Getters};
use sqlx::FromRow;

/// Disappearing-message settings of one conversation.
#[derive(FromRow, Getters, CopyGetters, Debug, Clone, PartialEq, Eq)]
pub struct DisappearingConfig {
    #[getset(get = "pub")]
    conversation_id: String,
    #[getset(get_copy = "pub")]
    enabled: bool,
    duration_ms: Option<i64>,
    /// Bumped on every change
    #[getset(get_copy = "pub")]
    version: i64,
    updated_at: i64,
}

impl DisappearingConfig {
    /// Expiration duration when enabled.
    pub fn duration(&self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        self.duration_ms
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }

    /// Last duration set, even if currently disabled.
    pub fn last_duration(&self) -> Option<Duration> {
        self.duration_ms
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        from_millis(self.updated_at)
    }
}
