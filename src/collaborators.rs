//! Contracts of the systems the engine drives but does not implement: the
//! transport, the session cipher, sync handling, attachment upload and the
//! reporting sink.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_job::{AttachmentPointer, Content, Envelope, JobType};
use thiserror::Error;
use tracing::{error, info};

use crate::errors::JobError;

/// Failure of [`SessionCipher::decrypt`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    /// e.g. the session store is temporarily locked
    #[error("retryable decryption failure: {0}")]
    Retryable(String),
    /// e.g. invalid MAC, unknown session, duplicate message
    #[error("terminal decryption failure: {0}")]
    Terminal(String),
}

impl DecryptError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecryptError::Retryable(_))
    }
}

impl From<DecryptError> for JobError {
    fn from(error: DecryptError) -> Self {
        match error {
            DecryptError::Retryable(_) => JobError::Retryable(error.to_string()),
            DecryptError::Terminal(_) => JobError::Terminal(error.to_string()),
        }
    }
}

/// Failure of a network-facing collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Network loss, timeouts, rate limiting
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// The service refused the request and will keep refusing it
    #[error("rejected by service: {0}")]
    Rejected(String),
    /// The target no longer exists (deleted conversation, unregistered recipient)
    #[error("target is gone: {0}")]
    Gone(String),
}

impl From<ServiceError> for JobError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Unavailable(_) => JobError::Retryable(error.to_string()),
            ServiceError::Rejected(_) => JobError::Terminal(error.to_string()),
            ServiceError::Gone(_) => JobError::Cancelled(error.to_string()),
        }
    }
}

/// Opaque encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext(pub Vec<u8>);

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, recipient: &str, ciphertext: &Ciphertext) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait SessionCipher: Send + Sync {
    async fn decrypt(&self, envelope: &Envelope) -> Result<Content, DecryptError>;

    async fn encrypt(&self, plaintext: &[u8], recipient: &str) -> Result<Ciphertext, ServiceError>;

    /// Drops the current session with `recipient` so the next message starts a new one.
    async fn archive_session(&self, recipient: &str) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait SyncProcessor: Send + Sync {
    async fn apply_group_sync(&self, data: &[u8]) -> Result<(), ServiceError>;

    async fn apply_contact_sync(&self, data: &[u8], is_complete: bool) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, attachment_id: &str) -> Result<AttachmentPointer, ServiceError>;
}

/// A job that ended in the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: String,
    pub job_type: JobType,
    pub partition_key: String,
    pub attempts: i32,
    pub error: String,
    /// The job kept failing with retryable errors until it ran out of attempts
    pub exhausted: bool,
}

/// Messages removed by one expiration sweep of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredMessages {
    pub conversation_id: String,
    pub message_ids: Vec<String>,
    pub swept_at: DateTime<Utc>,
}

/// Downstream sink for UI and telemetry. Calls are fire-and-forget and must not block.
pub trait Reporter: Send + Sync {
    fn job_failed(&self, failure: &JobFailure);

    fn messages_expired(&self, expired: &ExpiredMessages);
}

/// Reports through `tracing`. Used when no other reporter is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn job_failed(&self, failure: &JobFailure) {
        error!(
            job_id = %failure.job_id,
            job_type = %failure.job_type,
            partition = %failure.partition_key,
            attempts = failure.attempts,
            exhausted = failure.exhausted,
            error = %failure.error,
            "Job failed permanently"
        );
    }

    fn messages_expired(&self, expired: &ExpiredMessages) {
        info!(
            conversation_id = %expired.conversation_id,
            count = expired.message_ids.len(),
            "Expired disappearing messages"
        );
    }
}

/// The collaborators a job body may call.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub cipher: Arc<dyn SessionCipher>,
    pub sync: Arc<dyn SyncProcessor>,
    pub uploader: Arc<dyn AttachmentUploader>,
}
