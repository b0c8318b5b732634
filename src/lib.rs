//! Durable background processing for a secure messaging client.
//!
//! Every unit of deferred work (decrypting an envelope, applying its content,
//! syncing groups and contacts, resetting a session, sending a message,
//! broadcasting media) is a [`Job`] persisted in SQLite before anything acts on
//! it. A [`Worker`] runs one queue per [`JobType`]: jobs of one partition run one
//! at a time in insertion order, failed attempts are retried with exponential
//! backoff and a job can wait for other jobs to finish first.
//!
//! Disappearing messages are handled next to the queues: the
//! [`disappearing::ExpirationScheduler`] keeps a single timer armed for the
//! earliest deadline and deletes expired messages in one transaction per
//! conversation.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use courier::{Worker, Envelope, collaborators::*};
//! # async fn example(
//! #     transport: Arc<dyn Transport>,
//! #     cipher: Arc<dyn SessionCipher>,
//! #     sync: Arc<dyn SyncProcessor>,
//! #     uploader: Arc<dyn AttachmentUploader>,
//! #     envelopes: Vec<Envelope>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let worker = Worker::options()
//!     .database_url("sqlite://courier.db")
//!     .transport(transport)
//!     .cipher(cipher)
//!     .sync_processor(sync)
//!     .uploader(uploader)
//!     .init()
//!     .await?;
//!
//! worker.create_utils().enqueue_envelopes(&envelopes).await?;
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod batch_processor;
mod builder;
pub mod collaborators;
pub mod context;
pub mod disappearing;
pub mod errors;
mod jobs;
pub mod operation;
mod runner;
pub mod sql;
pub mod streams;
pub mod worker_utils;

pub use crate::backoff::RetryPolicy;
pub use crate::batch_processor::{BatchError, BatchMessageProcessor, BatchOutcome};
pub use crate::builder::{QueueOptions, WorkerBuildError, WorkerOptions};
pub use crate::context::JobContext;
pub use crate::errors::{CourierError, JobError};
pub use crate::operation::{
    Dependency, DependencyState, ErrorClass, ErrorClassifier, Operation, OperationState, Outcome,
};
pub use crate::runner::{ProcessJobError, ReleaseJobError, Worker, WorkerRuntimeError};
pub use crate::worker_utils::WorkerUtils;

pub use courier_clock::{mock::MockClock, Clock, SystemClock};
pub use courier_job::{
    AttachmentPointer, BroadcastMedia, Content, DecryptIncoming, Envelope, IncomingContactSync,
    IncomingGroupSync, Job, JobPayload, JobState, JobType, MessageContent, OutgoingMessage,
    SendOutgoing, SessionReset,
};
pub use courier_job_spec::{JobSpec, JobSpecBuilder};
pub use courier_migrations::MigrateError;
pub use courier_shutdown_signal::{ShutdownHandle, ShutdownSignal};
