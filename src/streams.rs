use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_clock::{add_duration, Clock};
use courier_job::JobType;
use courier_shutdown_signal::ShutdownSignal;
use futures::{stream, Stream};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::sql::get_job::next_run_at;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// First pass when the runner starts
    Startup,
    /// A job of this type was inserted or woken up
    Notification,
    /// The earliest `run_at` of the queue or the poll interval elapsed
    Timer,
}

/// In-process replacement for a database `LISTEN`: one notifier per job type,
/// pinged after every commit that makes a job of that type runnable.
#[derive(Clone, Debug)]
pub struct JobSignals {
    notifiers: Arc<HashMap<JobType, Arc<Notify>>>,
}

impl Default for JobSignals {
    fn default() -> Self {
        JobSignals {
            notifiers: Arc::new(
                JobType::ALL
                    .into_iter()
                    .map(|job_type| (job_type, Arc::new(Notify::new())))
                    .collect(),
            ),
        }
    }
}

impl JobSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the runner of `job_type`. A notification sent while the runner is busy
    /// is kept until it waits again.
    pub fn notify(&self, job_type: JobType) {
        if let Some(notify) = self.notifiers.get(&job_type) {
            notify.notify_one();
        }
    }

    pub fn notify_all<I: IntoIterator<Item = JobType>>(&self, job_types: I) {
        for job_type in job_types {
            self.notify(job_type);
        }
    }

    pub(crate) fn notifier(&self, job_type: JobType) -> Arc<Notify> {
        self.notifiers
            .get(&job_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }
}

struct JobSignalStreamData {
    job_type: JobType,
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    poll_interval: Duration,
    shutdown_signal: ShutdownSignal,
    started: bool,
}

/// Returns a stream that yields once at startup, then every time the queue of
/// `job_type` may have work: on insert notifications, when the earliest future
/// `run_at` of the queue is reached, and at least every `poll_interval`.
/// Ends when the shutdown signal resolves.
pub fn job_signal_stream(
    job_type: JobType,
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    signals: &JobSignals,
    poll_interval: Duration,
    shutdown_signal: ShutdownSignal,
) -> impl Stream<Item = StreamSource> {
    let stream_data = JobSignalStreamData {
        job_type,
        pool,
        clock,
        notify: signals.notifier(job_type),
        poll_interval,
        shutdown_signal,
        started: false,
    };

    stream::unfold(stream_data, |mut f| async move {
        if !f.started {
            f.started = true;
            return Some((StreamSource::Startup, f));
        }

        let poll_deadline = add_duration(f.clock.now(), f.poll_interval);
        let wake_at = match next_run_at(&f.pool, f.job_type, f.clock.now()).await {
            Ok(Some(run_at)) => run_at.min(poll_deadline),
            Ok(None) => poll_deadline,
            Err(e) => {
                warn!(job_type = %f.job_type, error = %e, "Could not read next run_at");
                poll_deadline
            }
        };
        trace!(job_type = %f.job_type, %wake_at, "Queue idle");

        tokio::select! {
            _ = f.notify.notified() => Some((StreamSource::Notification, f)),
            _ = f.clock.sleep_until(wake_at) => Some((StreamSource::Timer, f)),
            _ = f.shutdown_signal.clone() => None,
        }
    })
}
