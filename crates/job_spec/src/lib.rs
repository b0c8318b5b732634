use chrono::Utc;
use derive_builder::Builder;
use getset::{Getters, MutGetters, Setters};

/// Options applied when a job is inserted. Every field is optional and falls back
/// to the worker defaults.
#[derive(Getters, Setters, MutGetters, Debug, Default, Clone, Builder, PartialEq, Eq)]
#[getset(get = "pub", set = "pub", get_mut = "pub")]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct JobSpec {
    /// Earliest time the job may run. Defaults to "now" of the inserting clock.
    #[builder(setter(into))]
    pub run_at: Option<chrono::DateTime<Utc>>,

    pub max_attempts: Option<i32>,

    /// Overrides the lane derived from the payload.
    #[builder(setter(into))]
    pub partition_key: Option<String>,

    /// Deduplication key. Adding a job whose key is already taken is a no-op.
    #[builder(setter(into))]
    pub job_key: Option<String>,

    /// Ids of jobs that must complete before this one may start.
    #[builder(setter(custom))]
    pub depends_on: Vec<String>,
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> JobSpecBuilder {
        JobSpecBuilder::new()
    }
}

impl JobSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one dependency. Can be called several times.
    pub fn depends_on(mut self, job_id: impl Into<String>) -> Self {
        self.depends_on
            .get_or_insert_with(Vec::new)
            .push(job_id.into());
        self
    }

    pub fn build(self) -> JobSpec {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}

impl From<Option<JobSpec>> for JobSpec {
    fn from(spec: Option<JobSpec>) -> Self {
        spec.unwrap_or_default()
    }
}
