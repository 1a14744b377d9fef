//! Worker configuration.
//!
//! A builder for the knobs a claim/run worker core actually needs: which
//! job type to subscribe to, a diagnostic consumer id, the default grace
//! timeout shared by `shutdown` and `control.pause` (5000ms by default),
//! a backoff ceiling for the claim loop's own reconnect attempts (distinct
//! from a job's own retry backoff, see `job::BackoffConfig`), and
//! key-prefix overrides for the broker's two logical keys plus the job
//! hash key pattern.

use uuid::Uuid;

/// Default grace timeout (milliseconds) for `shutdown` and
/// `control.pause`.
pub const DEFAULT_GRACE_MS: u64 = 5000;

/// Configuration for a single worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job type this worker subscribes to.
    pub job_type: String,

    /// Stable, diagnostic-only consumer id (tracing spans, metrics
    /// labels). Generated once at construction unless overridden.
    pub consumer_id: String,

    /// Default grace timeout for `shutdown` and `control.pause` when the
    /// caller doesn't supply one.
    pub default_grace_ms: u64,

    /// How long the claimer blocks on the notification list per attempt
    /// before looping to re-check the shutdown signal. Purely an
    /// implementation knob for cooperative cancellation (see
    /// `claimer::JobClaimer::claim`).
    pub poll_interval_ms: u64,

    /// Ceiling on the claim loop's own reconnect backoff after repeated
    /// broker errors (`ErrorCategory::Connection` / `::Timeout`).
    /// Distinct from a job's retry backoff.
    pub max_reconnect_backoff_ms: u64,

    /// Override for the notification list key. Defaults to
    /// `jobs:<type>:waiting`.
    pub notify_key: Option<String>,

    /// Override for the inactive sorted-set key. Defaults to
    /// `jobs:<type>:inactive`.
    pub inactive_key: Option<String>,

    /// Override for the job hash key pattern. Defaults to
    /// `job:<type>:<id>`.
    pub job_key_prefix: Option<String>,
}

impl WorkerConfig {
    /// Create a new config for `job_type` with a freshly generated
    /// consumer id and sensible defaults.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            default_grace_ms: DEFAULT_GRACE_MS,
            poll_interval_ms: 5000,
            max_reconnect_backoff_ms: 30_000,
            notify_key: None,
            inactive_key: None,
            job_key_prefix: None,
        }
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_default_grace_ms(mut self, grace_ms: u64) -> Self {
        self.default_grace_ms = grace_ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    pub fn with_max_reconnect_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.max_reconnect_backoff_ms = backoff_ms;
        self
    }

    pub fn with_notify_key(mut self, key: impl Into<String>) -> Self {
        self.notify_key = Some(key.into());
        self
    }

    pub fn with_inactive_key(mut self, key: impl Into<String>) -> Self {
        self.inactive_key = Some(key.into());
        self
    }

    pub fn with_job_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.job_key_prefix = Some(prefix.into());
        self
    }

    pub fn default_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.default_grace_ms)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_default_grace() {
        let config = WorkerConfig::new("email");
        assert_eq!(config.default_grace_ms, 5000);
        assert!(config.consumer_id.starts_with("worker-"));
    }

    #[test]
    fn test_builder_overrides() {
        let config = WorkerConfig::new("email")
            .with_consumer_id("worker-1")
            .with_default_grace_ms(1000)
            .with_notify_key("custom:notify")
            .with_inactive_key("custom:inactive");

        assert_eq!(config.consumer_id, "worker-1");
        assert_eq!(config.default_grace_ms, 1000);
        assert_eq!(config.notify_key.as_deref(), Some("custom:notify"));
        assert_eq!(config.inactive_key.as_deref(), Some("custom:inactive"));
    }
}
