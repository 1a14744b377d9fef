//! The job entity and its lifecycle state machine.
//!
//! A `Job<J>` wraps a user payload `J` with the bookkeeping the worker core
//! needs to drive it through `inactive -> active -> complete | failed |
//! delayed`: attempt/backoff state, priority, and the persisted
//! result/error/duration fields. The worker core owns this wrapper type
//! rather than asking the caller's payload type to carry retry bookkeeping
//! itself.

use crate::error::WorkerError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Bound satisfied by any type usable as a job payload.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {}
impl<T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static> JobPayload for T {}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Sitting in the inactive set, eligible for claim.
    Inactive,
    /// Claimed by a worker and currently being run.
    Active,
    /// Terminal: the processor returned successfully.
    Complete,
    /// Terminal: the processor failed and no retry is left.
    Failed,
    /// Failed but re-armed for a future attempt after a backoff delay.
    Delayed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        };
        write!(f, "{s}")
    }
}

/// A custom backoff function: given the attempt number just exhausted,
/// returns the delay in milliseconds before the next attempt, or an error
/// if the function itself fails (in which case the runner falls back to
/// the job's base delay and surfaces the failure as an `error` event).
pub type BackoffFn = Arc<dyn Fn(u32) -> Result<u64, WorkerError> + Send + Sync>;

/// How a failed attempt is rescheduled.
#[derive(Clone)]
pub enum BackoffConfig {
    /// No backoff: a failed attempt with retries left goes straight back
    /// to `inactive`.
    None,
    /// A fixed delay applied on every retry.
    Fixed { delay_ms: u64 },
    /// A user-supplied function computing the delay from the attempt
    /// number.
    Custom(BackoffFn),
}

impl fmt::Debug for BackoffConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "BackoffConfig::None"),
            Self::Fixed { delay_ms } => write!(f, "BackoffConfig::Fixed({delay_ms})"),
            Self::Custom(_) => write!(f, "BackoffConfig::Custom(..)"),
        }
    }
}

/// Attempt bookkeeping for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct AttemptInfo {
    /// Attempts made so far, including the one currently in flight.
    pub made: u32,
    /// Maximum attempts allowed before the job is terminally failed.
    pub max: u32,
}

impl AttemptInfo {
    pub fn new(max: u32) -> Self {
        Self { made: 0, max }
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.made)
    }

    /// True once `made` has reached `max` — no further retry is allowed.
    pub fn exhausted(&self) -> bool {
        self.made >= self.max
    }

    pub fn next(&self) -> Self {
        Self {
            made: self.made + 1,
            max: self.max,
        }
    }
}

/// A job in flight through the worker core.
#[derive(Clone)]
pub struct Job<J> {
    pub id: String,
    pub job_type: String,
    pub data: J,
    pub state: JobState,
    pub priority: i64,
    pub attempts: AttemptInfo,
    pub backoff: BackoffConfig,
    pub delay_ms: u64,
    pub created_at_ms: i64,
    pub remove_on_complete: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Wall-clock time the processor took on the attempt that produced a
    /// terminal outcome, set once the job completes.
    pub duration_ms: Option<u64>,
}

impl<J: JobPayload> Job<J> {
    pub fn new(id: impl Into<String>, job_type: impl Into<String>, data: J) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            data,
            state: JobState::Inactive,
            priority: 0,
            attempts: AttemptInfo::new(3),
            backoff: BackoffConfig::None,
            delay_ms: 0,
            created_at_ms: 0,
            remove_on_complete: false,
            result: None,
            error: None,
            duration_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.attempts.max = max.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }
}

impl<J> fmt::Debug for Job<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Serialize, serde::Deserialize)]
    struct Payload {
        value: u32,
    }

    #[test]
    fn test_job_new_defaults() {
        let job = Job::new("1", "email", Payload { value: 7 });
        assert_eq!(job.state, JobState::Inactive);
        assert_eq!(job.attempts.made, 0);
        assert_eq!(job.attempts.max, 3);
        assert!(matches!(job.backoff, BackoffConfig::None));
        assert_eq!(job.duration_ms, None);
    }

    #[test]
    fn test_attempt_info_exhaustion() {
        let mut attempts = AttemptInfo::new(2);
        assert!(!attempts.exhausted());
        attempts = attempts.next();
        assert_eq!(attempts.made, 1);
        assert!(!attempts.exhausted());
        attempts = attempts.next();
        assert!(attempts.exhausted());
        assert_eq!(attempts.remaining(), 0);
    }

    #[test]
    fn test_job_state_display() {
        assert_eq!(JobState::Inactive.to_string(), "inactive");
        assert_eq!(JobState::Delayed.to_string(), "delayed");
    }

    #[test]
    fn test_custom_backoff_fn() {
        let backoff: BackoffFn = Arc::new(|attempt| Ok((attempt as u64 + 1) * 500));
        let job = Job::new("1", "email", Payload { value: 1 })
            .with_backoff(BackoffConfig::Custom(backoff.clone()));
        match &job.backoff {
            BackoffConfig::Custom(f) => assert_eq!(f(1).unwrap(), 1000),
            _ => panic!("expected custom backoff"),
        }
    }
}
