use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

/// Source of the current time and of timers.
///
/// Every component that compares against "now" or waits for a deadline goes
/// through this trait so that tests can drive time with [`mock::MockClock`].
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Resolves once `now() >= deadline`.
    async fn sleep_until(&self, deadline: DateTime<Utc>);

    async fn sleep(&self, duration: Duration) {
        let deadline = add_duration(self.now(), duration);
        self.sleep_until(deadline).await
    }
}

/// Adds a std duration to a timestamp, saturating instead of panicking on overflow.
pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Subtracts a std duration from a timestamp, saturating at the earliest date.
pub fn sub_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Converts a unix timestamp in milliseconds, as stored in the database.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Clone, Copy, Default, Debug)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let dur = deadline - Utc::now();
        let Ok(std_dur) = dur.to_std() else { return };
        tokio::time::sleep(std_dur).await;
    }
}

pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::Notify;

    /// Virtual clock. Time only moves when the test calls [`MockClock::advance`]
    /// or [`MockClock::set_time`], which wakes every pending `sleep_until`.
    #[derive(Clone)]
    pub struct MockClock {
        current_time: Arc<Mutex<DateTime<Utc>>>,
        wake_notify: Arc<Notify>,
    }

    impl MockClock {
        pub fn new(initial_time: DateTime<Utc>) -> Self {
            Self {
                current_time: Arc::new(Mutex::new(initial_time)),
                wake_notify: Arc::new(Notify::new()),
            }
        }

        pub fn set_time(&self, time: DateTime<Utc>) {
            *self
                .current_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = time;
            self.wake_notify.notify_waiters();
        }

        pub fn advance(&self, duration: Duration) {
            let mut time = self
                .current_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *time = add_duration(*time, duration);
            drop(time);
            self.wake_notify.notify_waiters();
        }
    }

    #[async_trait]
    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self
                .current_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
        }

        async fn sleep_until(&self, deadline: DateTime<Utc>) {
            loop {
                // Registered before the check so an advance in between is not lost.
                let notified = self.wake_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.now() >= deadline {
                    return;
                }
                notified.await;
            }
        }
    }
}
