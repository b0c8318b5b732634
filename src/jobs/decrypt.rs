use std::slice;

use courier_job::DecryptIncoming;
use tracing::debug;

use crate::context::JobContext;
use crate::errors::JobError;

/// Runs a single envelope through the batch processor, which records it as
/// processed and queues the job its content asks for.
pub(crate) async fn run(ctx: &JobContext, payload: DecryptIncoming) -> Result<(), JobError> {
    let outcome = ctx
        .batch_processor()
        .process_batch(slice::from_ref(&payload.envelope))
        .await?;

    debug!(
        envelope_id = %payload.envelope.id,
        processed = outcome.processed,
        jobs = outcome.jobs.len(),
        "Envelope decrypted"
    );
    Ok(())
}
