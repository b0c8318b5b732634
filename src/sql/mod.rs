pub mod add_job;
pub mod cancel_job;
pub mod complete_job;
pub mod disappearing;
pub mod envelopes;
pub mod fail_job;
pub mod get_job;
pub mod messages;
pub mod queue_details;
pub mod recover_jobs;
