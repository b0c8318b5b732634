use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use courier_clock::Clock;
use courier_job::{
    Content, Envelope, IncomingContactSync, IncomingGroupSync, Job, JobPayload, MessageContent,
};
use courier_job_spec::JobSpec;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};

use crate::collaborators::{DecryptError, SessionCipher};
use crate::errors::{CourierError, JobError};
use crate::sql::add_job::add_job;
use crate::sql::envelopes::{mark_envelope_processed, processed_envelope_ids};
use crate::streams::JobSignals;

/// Why a batch was rolled back. Nothing of the batch is persisted in any case.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Could not decrypt envelope '{envelope_id}' (#{index}): {source}")]
    Decrypt {
        index: usize,
        envelope_id: String,
        #[source]
        source: DecryptError,
    },
    #[error("Envelope '{envelope_id}' (#{index}) has malformed content: {reason}")]
    Malformed {
        index: usize,
        envelope_id: String,
        reason: String,
    },
    #[error("Store error while processing batch: {0}")]
    Store(#[from] CourierError),
}

impl BatchError {
    /// Presenting the same batch again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BatchError::Decrypt { source, .. } => source.is_retryable(),
            BatchError::Malformed { .. } => false,
            BatchError::Store(e) => e.is_transient(),
        }
    }

    /// Position in the batch of the envelope that caused the failure.
    pub fn envelope_index(&self) -> Option<usize> {
        match self {
            BatchError::Decrypt { index, .. } | BatchError::Malformed { index, .. } => Some(*index),
            BatchError::Store(_) => None,
        }
    }
}

impl From<sqlx::Error> for BatchError {
    fn from(error: sqlx::Error) -> Self {
        BatchError::Store(CourierError::from(error))
    }
}

impl From<BatchError> for JobError {
    fn from(error: BatchError) -> Self {
        if error.is_retryable() {
            JobError::Retryable(error.to_string())
        } else {
            JobError::Terminal(error.to_string())
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Envelopes recorded as processed by this call
    pub processed: usize,
    /// Envelopes already processed before, or repeated in the batch
    pub skipped: usize,
    /// Jobs created from the processed envelopes, in envelope order
    pub jobs: Vec<Job>,
}

/// Turns raw envelopes into jobs, all or nothing.
///
/// Decryption happens before the transaction opens. The transaction then records
/// every envelope as processed and inserts the resulting jobs, so a crash or an
/// error at any envelope leaves the whole batch unprocessed, and a batch presented
/// again after success creates no duplicate.
#[derive(Clone)]
pub struct BatchMessageProcessor {
    pool: SqlitePool,
    cipher: Arc<dyn SessionCipher>,
    clock: Arc<dyn Clock>,
    signals: JobSignals,
}

impl BatchMessageProcessor {
    pub fn new(
        pool: SqlitePool,
        cipher: Arc<dyn SessionCipher>,
        clock: Arc<dyn Clock>,
        signals: JobSignals,
    ) -> Self {
        BatchMessageProcessor {
            pool,
            cipher,
            clock,
            signals,
        }
    }

    #[tracing::instrument(skip_all, err, fields(batch_size = envelopes.len()))]
    pub async fn process_batch(&self, envelopes: &[Envelope]) -> Result<BatchOutcome, BatchError> {
        let ids: Vec<String> = envelopes.iter().map(|e| e.id.clone()).collect();
        let already_processed = processed_envelope_ids(&self.pool, &ids).await?;

        let mut seen = HashSet::new();
        let mut decrypted = Vec::with_capacity(envelopes.len());
        for (index, envelope) in envelopes.iter().enumerate() {
            if already_processed.contains(&envelope.id) || !seen.insert(envelope.id.as_str()) {
                continue;
            }
            let content =
                self.cipher
                    .decrypt(envelope)
                    .await
                    .map_err(|source| BatchError::Decrypt {
                        index,
                        envelope_id: envelope.id.clone(),
                        source,
                    })?;
            decrypted.push((index, envelope, content));
        }

        let mut outcome = BatchOutcome {
            skipped: envelopes.len() - decrypted.len(),
            ..Default::default()
        };
        if decrypted.is_empty() {
            debug!(skipped = outcome.skipped, "Nothing new in batch");
            return Ok(outcome);
        }

        let now = self.clock.now();
        let mut job_types = BTreeSet::new();
        let mut tx = self.pool.begin().await?;
        for (index, envelope, content) in decrypted {
            if !mark_envelope_processed(&mut *tx, &envelope.id, now).await? {
                outcome.skipped += 1;
                continue;
            }
            outcome.processed += 1;

            let Some(payload) = content_job(index, envelope, content)? else {
                continue;
            };
            if let Some(job) = add_job(&mut *tx, &payload, &JobSpec::default(), now).await? {
                job_types.insert(job.job_type());
                outcome.jobs.push(job);
            }
        }
        tx.commit().await?;

        info!(
            processed = outcome.processed,
            skipped = outcome.skipped,
            jobs = outcome.jobs.len(),
            "Batch processed"
        );
        self.signals.notify_all(job_types);
        Ok(outcome)
    }
}

/// The job an envelope's content turns into. Receipts and other empty content
/// create none.
fn content_job(
    index: usize,
    envelope: &Envelope,
    content: Content,
) -> Result<Option<JobPayload>, BatchError> {
    let malformed = |reason: &str| BatchError::Malformed {
        index,
        envelope_id: envelope.id.clone(),
        reason: reason.to_string(),
    };

    match &content {
        Content::Data {
            conversation_id, ..
        } if conversation_id.is_empty() => {
            return Err(malformed("data message without conversation"))
        }
        Content::ExpirationTimerUpdate {
            conversation_id, ..
        } if conversation_id.is_empty() => {
            return Err(malformed("timer update without conversation"))
        }
        Content::ExpirationTimerUpdate {
            duration_ms: Some(0),
            ..
        } => return Err(malformed("timer update with a zero duration")),
        _ => {}
    }

    let payload = match content {
        Content::Data { .. } | Content::ExpirationTimerUpdate { .. } => {
            message_content(envelope, content)
        }
        Content::GroupSync { data } => JobPayload::IncomingGroupSync(IncomingGroupSync { data }),
        Content::ContactSync { data, is_complete } => {
            JobPayload::IncomingContactSync(IncomingContactSync { data, is_complete })
        }
        Content::Empty => {
            debug!(envelope_id = %envelope.id, "Envelope has no content to process");
            return Ok(None);
        }
    };

    Ok(Some(payload))
}

fn message_content(envelope: &Envelope, content: Content) -> JobPayload {
    JobPayload::MessageContent(MessageContent {
        envelope_id: envelope.id.clone(),
        source: envelope.source.clone(),
        timestamp: envelope.timestamp,
        content,
    })
}
