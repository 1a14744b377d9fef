//! Job persistence.
//!
//! `RedisJobStore` is a narrow type wrapping a `ConnectionManager`, one
//! method per field-level mutation, so the runner can incrementally
//! persist state/error/attempts/delay as a job moves through its
//! lifecycle without re-saving the whole record each time.

use crate::error::WorkerError;
use crate::job::{AttemptInfo, BackoffConfig, BackoffFn, Job, JobPayload, JobState};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::marker::PhantomData;
use tracing::debug;

/// Storage seam for job records. A `Worker` is generic over this so tests
/// can swap in an in-memory fake (see `claimer`/`runner`/`lifecycle` test
/// modules) without a live Redis.
#[async_trait]
pub trait JobStore<J: JobPayload>: Send + Sync {
    async fn load(&self, job_id: &str) -> Result<Option<Job<J>>, WorkerError>;
    async fn save(&self, job: &Job<J>) -> Result<(), WorkerError>;
    async fn set_state(&self, job_id: &str, state: JobState) -> Result<(), WorkerError>;
    async fn set_result(
        &self,
        job_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<(), WorkerError>;
    async fn set_error(&self, job_id: &str, error: Option<String>) -> Result<(), WorkerError>;
    async fn set_attempts(&self, job_id: &str, attempts: AttemptInfo) -> Result<(), WorkerError>;
    async fn set_delay(&self, job_id: &str, delay_ms: u64) -> Result<(), WorkerError>;
    async fn set_duration(&self, job_id: &str, duration_ms: u64) -> Result<(), WorkerError>;
    async fn remove(&self, job_id: &str) -> Result<(), WorkerError>;
}

/// A job stored as a Redis hash at `job:<type>:<id>`.
///
/// Custom backoff functions (`BackoffConfig::Custom`) are process-local Rust
/// closures and cannot be round-tripped through Redis: the hash records only
/// that a custom backoff was requested (`backoff_kind = "custom"`) plus the
/// last delay as a fallback. The concrete function is supplied once at
/// `RedisJobStore` construction and applied uniformly to every job of this
/// store's type, one policy per job type rather than per individual job.
pub struct RedisJobStore<J> {
    redis: ConnectionManager,
    job_type: String,
    key_prefix: Option<String>,
    custom_backoff: Option<BackoffFn>,
    _phantom: PhantomData<J>,
}

impl<J: JobPayload> RedisJobStore<J> {
    pub fn new(redis: ConnectionManager, job_type: impl Into<String>) -> Self {
        Self {
            redis,
            job_type: job_type.into(),
            key_prefix: None,
            custom_backoff: None,
            _phantom: PhantomData,
        }
    }

    pub fn with_custom_backoff(mut self, backoff: BackoffFn) -> Self {
        self.custom_backoff = Some(backoff);
        self
    }

    /// Override the default `job:<type>:<id>` key pattern (e.g. from a
    /// `WorkerConfig::job_key_prefix`). `prefix` replaces `job:<type>`; the
    /// id is still appended with a `:` separator.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    fn key(&self, job_id: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{job_id}"),
            None => format!("job:{}:{}", self.job_type, job_id),
        }
    }

    fn backoff_kind(backoff: &BackoffConfig) -> &'static str {
        match backoff {
            BackoffConfig::None => "none",
            BackoffConfig::Fixed { .. } => "fixed",
            BackoffConfig::Custom(_) => "custom",
        }
    }
}

#[async_trait]
impl<J: JobPayload> JobStore<J> for RedisJobStore<J> {
    async fn load(&self, job_id: &str) -> Result<Option<Job<J>>, WorkerError> {
        let mut conn = self.redis.clone();
        let map: HashMap<String, String> = conn.hgetall(self.key(job_id)).await?;

        if map.is_empty() {
            return Ok(None);
        }

        let get = |field: &str| -> Result<&str, WorkerError> {
            map.get(field)
                .map(|s| s.as_str())
                .ok_or_else(|| WorkerError::Malformed(format!("missing field '{field}'")))
        };

        let data: J = serde_json::from_str(get("payload")?)?;
        let state = match get("state")? {
            "inactive" => JobState::Inactive,
            "active" => JobState::Active,
            "complete" => JobState::Complete,
            "failed" => JobState::Failed,
            "delayed" => JobState::Delayed,
            other => return Err(WorkerError::Malformed(format!("unknown state '{other}'"))),
        };

        let delay_ms: u64 = get("delay_ms")?
            .parse()
            .map_err(|_| WorkerError::Malformed("bad delay_ms".into()))?;

        let backoff = match get("backoff_kind")? {
            "none" => BackoffConfig::None,
            "fixed" => BackoffConfig::Fixed { delay_ms },
            "custom" => self
                .custom_backoff
                .clone()
                .map(BackoffConfig::Custom)
                .unwrap_or(BackoffConfig::Fixed { delay_ms }),
            other => return Err(WorkerError::Malformed(format!("unknown backoff '{other}'"))),
        };

        let attempts = AttemptInfo {
            made: get("attempts_made")?
                .parse()
                .map_err(|_| WorkerError::Malformed("bad attempts_made".into()))?,
            max: get("attempts_max")?
                .parse()
                .map_err(|_| WorkerError::Malformed("bad attempts_max".into()))?,
        };

        let result = map
            .get("result")
            .filter(|s| !s.is_empty())
            .map(|s| serde_json::from_str(s))
            .transpose()?;

        Ok(Some(Job {
            id: job_id.to_string(),
            job_type: self.job_type.clone(),
            data,
            state,
            priority: get("priority")?
                .parse()
                .map_err(|_| WorkerError::Malformed("bad priority".into()))?,
            attempts,
            backoff,
            delay_ms,
            created_at_ms: get("created_at_ms")?
                .parse()
                .map_err(|_| WorkerError::Malformed("bad created_at_ms".into()))?,
            remove_on_complete: get("remove_on_complete")? == "1",
            result,
            error: map.get("error").filter(|s| !s.is_empty()).cloned(),
            duration_ms: map
                .get("duration_ms")
                .filter(|s| !s.is_empty())
                .map(|s| s.parse())
                .transpose()
                .map_err(|_| WorkerError::Malformed("bad duration_ms".into()))?,
        }))
    }

    async fn save(&self, job: &Job<J>) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let payload = serde_json::to_string(&job.data)?;
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();

        let fields: Vec<(&str, String)> = vec![
            ("payload", payload),
            ("state", job.state.to_string()),
            ("priority", job.priority.to_string()),
            ("attempts_made", job.attempts.made.to_string()),
            ("attempts_max", job.attempts.max.to_string()),
            ("backoff_kind", Self::backoff_kind(&job.backoff).to_string()),
            ("delay_ms", job.delay_ms.to_string()),
            ("created_at_ms", job.created_at_ms.to_string()),
            (
                "remove_on_complete",
                if job.remove_on_complete { "1" } else { "0" }.to_string(),
            ),
            ("result", result),
            ("error", job.error.clone().unwrap_or_default()),
            (
                "duration_ms",
                job.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
            ),
        ];

        let _: () = conn.hset_multiple(self.key(&job.id), &fields).await?;
        debug!(job_id = %job.id, job_type = %self.job_type, "saved job record");
        Ok(())
    }

    async fn set_state(&self, job_id: &str, state: JobState) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(self.key(job_id), "state", state.to_string())
            .await?;
        Ok(())
    }

    async fn set_result(
        &self,
        job_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let encoded = result.map(|v| v.to_string()).unwrap_or_default();
        let _: () = conn.hset(self.key(job_id), "result", encoded).await?;
        Ok(())
    }

    async fn set_error(&self, job_id: &str, error: Option<String>) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(self.key(job_id), "error", error.unwrap_or_default())
            .await?;
        Ok(())
    }

    async fn set_attempts(&self, job_id: &str, attempts: AttemptInfo) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let fields = [
            ("attempts_made", attempts.made.to_string()),
            ("attempts_max", attempts.max.to_string()),
        ];
        let _: () = conn.hset_multiple(self.key(job_id), &fields).await?;
        Ok(())
    }

    async fn set_delay(&self, job_id: &str, delay_ms: u64) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(self.key(job_id), "delay_ms", delay_ms.to_string())
            .await?;
        Ok(())
    }

    async fn set_duration(&self, job_id: &str, duration_ms: u64) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(self.key(job_id), "duration_ms", duration_ms.to_string())
            .await?;
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(self.key(job_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        // RedisJobStore needs a live ConnectionManager to construct, so this
        // only exercises the pure key-formatting logic.
        let job_type = "email";
        let job_id = "42";
        assert_eq!(format!("job:{job_type}:{job_id}"), "job:email:42");
    }

    #[test]
    fn test_backoff_kind_mapping() {
        assert_eq!(
            RedisJobStore::<()>::backoff_kind(&BackoffConfig::None),
            "none"
        );
        assert_eq!(
            RedisJobStore::<()>::backoff_kind(&BackoffConfig::Fixed { delay_ms: 100 }),
            "fixed"
        );
    }
}
