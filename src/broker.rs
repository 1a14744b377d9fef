//! The broker adapter: the only module that speaks the wire protocol of the
//! underlying Redis primitives backing the queue.
//!
//! Wraps a `ConnectionManager` in a handful of narrow, single-purpose
//! async methods implementing the two-phase claim primitive: a blocking
//! list wait for notification, and an atomic sorted-set pop as the sole
//! source of truth for which worker actually claimed a job.

use crate::error::WorkerError;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

/// A notification pushed to unblock a parked worker without itself
/// guaranteeing a claimable job — every claimer treats this identically to
/// a real notification (see `claimer::JobClaimer::claim`).
const RECOVERY_TOKEN: &str = "1";

/// Talks to the two logical Redis structures assigned to a given job
/// type: the notification list workers block on, and the inactive
/// sorted set ordered by priority that `pop_first` atomically drains from.
pub struct BrokerAdapter {
    redis: ConnectionManager,
    notify_key: String,
    inactive_key: String,
}

impl BrokerAdapter {
    pub fn new(redis: ConnectionManager, job_type: impl AsRef<str>) -> Self {
        let job_type = job_type.as_ref();
        Self {
            redis,
            notify_key: format!("jobs:{job_type}:waiting"),
            inactive_key: format!("jobs:{job_type}:inactive"),
        }
    }

    /// Override the default key naming (used when a `WorkerConfig` supplies
    /// explicit key-prefix overrides).
    pub fn with_keys(mut self, notify_key: impl Into<String>, inactive_key: impl Into<String>) -> Self {
        self.notify_key = notify_key.into();
        self.inactive_key = inactive_key.into();
        self
    }

    pub fn notify_key(&self) -> &str {
        &self.notify_key
    }

    pub fn inactive_key(&self) -> &str {
        &self.inactive_key
    }

    /// Block on the notification list until a notification arrives or
    /// `timeout` elapses. Returns `Ok(true)` on notification, `Ok(false)`
    /// on benign timeout (not an error — the caller simply loops).
    pub async fn wait_for_notification(&self, timeout: Duration) -> Result<bool, WorkerError> {
        let mut conn = self.redis.clone();
        let secs = timeout.as_secs_f64().max(0.001);

        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.notify_key)
            .arg(secs)
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    /// Push the recovery token onto the notification list. Used both when
    /// the claimer hits an error mid-wait (so a peer worker isn't starved)
    /// and by the lifecycle controller as the final step of graceful
    /// shutdown.
    pub async fn push_notification(&self) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.lpush(&self.notify_key, RECOVERY_TOKEN).await?;
        debug!(key = %self.notify_key, "pushed recovery token");
        Ok(())
    }

    /// Atomically pop the highest-priority job id from the inactive set.
    /// This, not the blocking wait, is the authoritative claim: a
    /// notification with nothing left to pop is benign and the caller
    /// should simply return to waiting.
    pub async fn pop_first(&self) -> Result<Option<String>, WorkerError> {
        let mut conn = self.redis.clone();

        // ZPOPMIN is itself atomic, giving the same "peek lowest rank,
        // remove it" claim guarantee a ZRANGE+ZREM transaction would, in
        // one round trip instead of two.
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(&self.inactive_key)
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(popped.into_iter().next().map(|(member, _score)| member))
    }

    /// Add a job id to the inactive set with the given priority as its
    /// sort key (lower score is claimed first).
    pub async fn push_inactive(&self, job_id: &str, priority: i64) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.zadd(&self.inactive_key, job_id, priority).await?;
        Ok(())
    }

    /// Cardinality of the inactive set (used by the queue-depth health
    /// endpoint).
    pub async fn inactive_depth(&self) -> Result<u64, WorkerError> {
        let mut conn = self.redis.clone();
        let depth: u64 = conn.zcard(&self.inactive_key).await?;
        Ok(depth)
    }

    /// Length of the notification list (used by the queue-depth health
    /// endpoint).
    pub async fn notify_depth(&self) -> Result<u64, WorkerError> {
        let mut conn = self.redis.clone();
        let depth: u64 = conn.llen(&self.notify_key).await?;
        Ok(depth)
    }

    /// Close out this broker adapter's use of the shared connection.
    ///
    /// `redis::aio::ConnectionManager` multiplexes over a single
    /// connection it reconnects internally, so there is nothing to
    /// explicitly tear down per-adapter; this exists as the named
    /// counterpart to the lifecycle's "close the shared connection" step
    /// and as the seam a future pooled implementation would hook into.
    pub async fn close(&self) {
        debug!(notify_key = %self.notify_key, "broker adapter closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        // Can't construct a ConnectionManager without a live Redis, so this
        // only checks the default key formatting logic in isolation.
        let notify_key = format!("jobs:{}:waiting", "email");
        let inactive_key = format!("jobs:{}:inactive", "email");
        assert_eq!(notify_key, "jobs:email:waiting");
        assert_eq!(inactive_key, "jobs:email:inactive");
    }
}
