mod config;
mod finder;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_clock::{add_duration, from_millis, Clock};
use courier_shutdown_signal::ShutdownSignal;
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::collaborators::{ExpiredMessages, Reporter};
use crate::errors::{CourierError, Result};
use crate::sql;

pub use config::DisappearingConfig;
pub use finder::{Message, MessageDirection, MessageFinder, NewMessage};

/// A started expiration that has not been swept yet.
///
/// Field order matters: the derived `Ord` compares `expires_at` first, which is what
/// the scheduler heap sorts on.
#[derive(FromRow, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingExpiration {
    pub expires_at: i64,
    pub message_id: String,
    pub conversation_id: String,
}

impl PendingExpiration {
    pub fn deadline(&self) -> DateTime<Utc> {
        from_millis(self.expires_at)
    }
}

struct Inner {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn Reporter>,
    deadlines: Mutex<BinaryHeap<Reverse<PendingExpiration>>>,
    wake: Notify,
    fallback_interval: Duration,
    store_retry_delay: Duration,
}

/// Owns message expiration: starts deadlines, keeps one timer armed for the earliest
/// one and deletes messages once it fires.
///
/// Cloning is cheap, every clone shares the same timer.
#[derive(Clone)]
pub struct ExpirationScheduler {
    inner: Arc<Inner>,
}

impl ExpirationScheduler {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn Reporter>,
        fallback_interval: Duration,
    ) -> Self {
        ExpirationScheduler {
            inner: Arc::new(Inner {
                pool,
                clock,
                reporter,
                deadlines: Mutex::new(BinaryHeap::new()),
                wake: Notify::new(),
                fallback_interval,
                store_retry_delay: Duration::from_secs(1),
            }),
        }
    }

    /// Enables disappearing messages for a conversation with `duration`, or disables
    /// them with `None`. Deadlines that already started keep their value.
    pub async fn set_configuration(
        &self,
        conversation_id: &str,
        duration: Option<Duration>,
    ) -> Result<DisappearingConfig> {
        let duration_ms = match duration {
            Some(duration) if duration.is_zero() => {
                return Err(CourierError::InvalidExpirationDuration(
                    conversation_id.to_string(),
                ))
            }
            Some(duration) => Some(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)),
            None => None,
        };

        let config = sql::disappearing::upsert_configuration(
            &self.inner.pool,
            conversation_id,
            duration_ms,
            self.inner.clock.now(),
        )
        .await?;

        info!(
            conversation_id,
            enabled = config.enabled(),
            version = config.version(),
            "Disappearing messages configuration changed"
        );
        Ok(config)
    }

    pub async fn get_configuration(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DisappearingConfig>> {
        sql::disappearing::get_configuration(&self.inner.pool, conversation_id).await
    }

    /// Starts the expiration of a message at `started_at` with its conversation's
    /// current duration. Returns `None` when it already started or when the
    /// conversation has disappearing messages disabled.
    pub async fn start_expiration(
        &self,
        message_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Option<PendingExpiration>> {
        let pending =
            sql::disappearing::start_expiration(&self.inner.pool, message_id, started_at).await?;

        if let Some(pending) = &pending {
            debug!(
                message_id,
                conversation_id = %pending.conversation_id,
                expires_at = %pending.deadline(),
                "Message expiration started"
            );
            self.push(pending.clone());
        }

        Ok(pending)
    }

    /// Records that a message was read (or sent) and starts its expiration.
    pub async fn mark_read(
        &self,
        message_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<Option<PendingExpiration>> {
        sql::messages::mark_read(&self.inner.pool, message_id, read_at).await?;
        self.start_expiration(message_id, read_at).await
    }

    /// Rebuilds the in-memory deadlines from the store and starts the expirations a
    /// crash left behind between a read and its start.
    pub async fn load_pending(&self) -> Result<usize> {
        let pending = sql::disappearing::pending_expirations(&self.inner.pool).await?;
        let loaded = pending.len();
        {
            let mut deadlines = self.deadlines();
            deadlines.clear();
            deadlines.extend(pending.into_iter().map(Reverse));
        }

        let unstarted = sql::disappearing::unstarted_read_messages(&self.inner.pool).await?;
        let mut backfilled = 0;
        for (message_id, read_at) in unstarted {
            if self
                .start_expiration(&message_id, from_millis(read_at))
                .await?
                .is_some()
            {
                backfilled += 1;
            }
        }

        if backfilled > 0 {
            warn!(backfilled, "Started expirations missed before the last shutdown");
        }
        debug!(loaded, backfilled, "Loaded pending expirations");
        self.inner.wake.notify_one();
        Ok(loaded + backfilled)
    }

    /// Deletes every message whose deadline is reached, one transaction per
    /// conversation. Returns how many messages were deleted.
    pub async fn sweep(&self) -> Result<usize> {
        let now = self.inner.clock.now();
        let conversations =
            sql::disappearing::expired_conversations(&self.inner.pool, now).await?;

        let mut deleted = 0;
        for conversation_id in conversations {
            let mut tx = self.inner.pool.begin().await?;
            let message_ids =
                sql::disappearing::delete_expired(&mut *tx, &conversation_id, now).await?;
            tx.commit().await?;

            if message_ids.is_empty() {
                continue;
            }
            deleted += message_ids.len();
            info!(
                conversation_id = %conversation_id,
                count = message_ids.len(),
                "Expired messages deleted"
            );
            self.inner.reporter.messages_expired(&ExpiredMessages {
                conversation_id,
                message_ids,
                swept_at: now,
            });
        }

        let now_ms = now.timestamp_millis();
        let mut deadlines = self.deadlines();
        while deadlines
            .peek()
            .is_some_and(|Reverse(next)| next.expires_at <= now_ms)
        {
            deadlines.pop();
        }

        Ok(deleted)
    }

    /// Earliest deadline not swept yet.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.deadlines()
            .peek()
            .map(|Reverse(next)| next.deadline())
    }

    /// Timer loop. Sleeps until the earliest deadline, or at most `fallback_interval`,
    /// then sweeps. Returns once shutdown is signalled.
    pub async fn run(&self, shutdown_signal: ShutdownSignal) {
        let clock = self.inner.clock.as_ref();
        let mut retry_delay = self.inner.store_retry_delay;

        loop {
            let fallback = add_duration(clock.now(), self.inner.fallback_interval);
            let wake_at = self
                .next_deadline()
                .map_or(fallback, |deadline| deadline.min(fallback));

            tokio::select! {
                _ = clock.sleep_until(wake_at) => {},
                _ = self.inner.wake.notified() => continue,
                _ = shutdown_signal.clone() => {
                    debug!("Expiration scheduler stopped");
                    return;
                }
            }

            match self.sweep().await {
                Ok(_) => retry_delay = self.inner.store_retry_delay,
                Err(e) => {
                    error!(error = %e, ?retry_delay, "Failed to sweep expired messages");
                    tokio::select! {
                        _ = tokio::time::sleep(retry_delay) => {},
                        _ = shutdown_signal.clone() => return,
                    }
                    retry_delay = (retry_delay * 2).min(self.inner.fallback_interval);
                }
            }
        }
    }

    fn push(&self, pending: PendingExpiration) {
        self.deadlines().push(Reverse(pending));
        self.inner.wake.notify_one();
    }

    fn deadlines(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Reverse<PendingExpiration>>> {
        self.inner
            .deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
