use std::fmt::Display;
use std::future::Future;

use chrono::{DateTime, Utc};
use courier_clock::{add_duration, Clock};
use tracing::debug;

use crate::backoff::RetryPolicy;
use crate::errors::JobError;

/// Lifecycle of one [`Operation`]. Transitions only move forward:
/// `Pending → Running → {Succeeded, Retrying, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Succeeded,
    /// Waiting for its backoff. The next attempt is a new operation.
    Retrying { run_at: DateTime<Utc> },
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationState::Pending | OperationState::Running)
    }

    fn can_transition_to(&self, next: &OperationState) -> bool {
        match (self, next) {
            (OperationState::Pending, OperationState::Running) => true,
            (OperationState::Pending, OperationState::Failed) => true,
            (OperationState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
    /// Terminal, but the work is no longer meaningful: discard without reporting
    Silent,
}

/// Classifies the errors of a work function.
pub trait ErrorClassifier<E> {
    fn classify(&self, error: &E) -> ErrorClass;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClass,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// Classifier for job bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobErrorClassifier;

impl ErrorClassifier<JobError> for JobErrorClassifier {
    fn classify(&self, error: &JobError) -> ErrorClass {
        match error {
            JobError::Retryable(_) => ErrorClass::Retryable,
            JobError::Terminal(_) => ErrorClass::Terminal,
            JobError::Cancelled(_) => ErrorClass::Silent,
        }
    }
}

/// Persisted state of a job another job depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// Completed. A dependency whose record is gone has completed too.
    Done,
    /// Not finished yet
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub job_id: String,
    pub state: DependencyState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyCheck {
    Met,
    Unmet,
    /// Id of the first failed dependency
    Failed(String),
}

/// A failed dependency wins over pending ones: the dependent can never run.
pub fn check_dependencies(dependencies: &[Dependency]) -> DependencyCheck {
    if let Some(failed) = dependencies
        .iter()
        .find(|d| d.state == DependencyState::Failed)
    {
        return DependencyCheck::Failed(failed.job_id.clone());
    }
    if dependencies
        .iter()
        .any(|d| d.state == DependencyState::Pending)
    {
        return DependencyCheck::Unmet;
    }
    DependencyCheck::Met
}

/// What the runner has to persist after an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retry {
        run_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        error: String,
        /// Retryable errors ran out of attempts
        exhausted: bool,
    },
    /// Dropped without retry nor report
    Discarded { reason: String },
    /// Dependencies are not met yet, nothing ran
    Blocked,
}

/// One attempt of a unit of work, with its retry decision.
///
/// `W` is the work function and `C` classifies its errors. The operation is
/// single-use: the work runs at most once and the state only moves forward.
pub struct Operation<W, C> {
    job_id: String,
    attempt: i32,
    max_attempts: i32,
    dependencies: Vec<Dependency>,
    work: Option<W>,
    classifier: C,
    retry_policy: RetryPolicy,
    state: OperationState,
    last_error_class: Option<ErrorClass>,
}

impl<W, C> Operation<W, C> {
    /// `attempt` is the 1-based number of the attempt this operation makes.
    pub fn new(
        job_id: impl Into<String>,
        attempt: i32,
        max_attempts: i32,
        work: W,
        classifier: C,
        retry_policy: RetryPolicy,
    ) -> Self {
        Operation {
            job_id: job_id.into(),
            attempt,
            max_attempts,
            dependencies: Vec::new(),
            work: Some(work),
            classifier,
            retry_policy,
            state: OperationState::Pending,
            last_error_class: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn last_error_class(&self) -> Option<ErrorClass> {
        self.last_error_class
    }

    /// Deadline of the next attempt, once the operation is retrying.
    pub fn backoff_deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            OperationState::Retrying { run_at } => Some(run_at),
            _ => None,
        }
    }

    fn transition(&mut self, next: OperationState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "invalid operation transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(job_id = %self.job_id, from = ?self.state, to = ?next, "Operation transition");
        self.state = next;
    }
}

impl<W, Fut, E, C> Operation<W, C>
where
    W: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
    C: ErrorClassifier<E>,
{
    /// Runs the work once and classifies its result.
    ///
    /// Nothing runs while a dependency is pending (the operation stays
    /// `Pending`) or failed (the operation fails without running).
    pub async fn run(&mut self, clock: &dyn Clock) -> Outcome {
        if self.state != OperationState::Pending {
            return Outcome::Discarded {
                reason: format!("operation already left pending ({:?})", self.state),
            };
        }

        match check_dependencies(&self.dependencies) {
            DependencyCheck::Met => {}
            DependencyCheck::Unmet => return Outcome::Blocked,
            DependencyCheck::Failed(dependency) => {
                self.last_error_class = Some(ErrorClass::Terminal);
                self.transition(OperationState::Failed);
                return Outcome::Failed {
                    error: format!("dependency '{dependency}' failed"),
                    exhausted: false,
                };
            }
        }

        let Some(work) = self.work.take() else {
            return Outcome::Discarded {
                reason: "operation has no work left".to_string(),
            };
        };

        self.transition(OperationState::Running);
        let result = work().await;

        let error = match result {
            Ok(()) => {
                self.transition(OperationState::Succeeded);
                return Outcome::Succeeded;
            }
            Err(error) => error,
        };

        let class = self.classifier.classify(&error);
        self.last_error_class = Some(class);
        match class {
            ErrorClass::Retryable if self.attempt >= self.max_attempts => {
                self.transition(OperationState::Failed);
                Outcome::Failed {
                    error: format!(
                        "{error} (gave up after {} attempts)",
                        self.attempt
                    ),
                    exhausted: true,
                }
            }
            ErrorClass::Retryable => {
                let delay = self.retry_policy.delay(self.attempt);
                let run_at = add_duration(clock.now(), delay);
                self.transition(OperationState::Retrying { run_at });
                Outcome::Retry {
                    run_at,
                    error: error.to_string(),
                }
            }
            ErrorClass::Terminal => {
                self.transition(OperationState::Failed);
                Outcome::Failed {
                    error: error.to_string(),
                    exhausted: false,
                }
            }
            ErrorClass::Silent => {
                self.transition(OperationState::Failed);
                Outcome::Discarded {
                    reason: error.to_string(),
                }
            }
        }
    }
}
