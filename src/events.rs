//! Lifecycle events: the worker-level `error` channel and the per-job
//! `complete` / `failed attempt` / `failed` events named in the external
//! interfaces.
//!
//! Events are emitted explicitly by the runner and lifecycle controller
//! at each transition, rather than inferred from broker-level delivery
//! metadata.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// A lifecycle event emitted by a worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A claim-loop or backoff-function error, not tied to a terminal job
    /// transition.
    Error { job_type: String, message: String },
    /// A job finished successfully. `result` carries the same value
    /// delivered to the per-job `complete(result)` channel.
    JobComplete {
        job_type: String,
        job_id: String,
        result: Option<serde_json::Value>,
    },
    /// A job failed this attempt but was rescheduled (delayed or
    /// re-armed).
    JobFailedAttempt {
        job_type: String,
        job_id: String,
        attempt: u32,
        delay_ms: Option<u64>,
    },
    /// A job failed and exhausted its attempt budget (or was force-failed
    /// by shutdown).
    JobFailed {
        job_type: String,
        job_id: String,
        error: String,
    },
}

impl WorkerEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Error { .. } => None,
            Self::JobComplete { job_id, .. }
            | Self::JobFailedAttempt { job_id, .. }
            | Self::JobFailed { job_id, .. } => Some(job_id),
        }
    }
}

/// Sink for worker events. A `Worker` holds one of these and calls it on
/// every lifecycle transition.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: WorkerEvent);
}

/// In-process fan-out, for callers (or tests) that want to subscribe
/// without a Redis round trip.
pub struct LocalEventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventEmitter for LocalEventBus {
    async fn emit(&self, event: WorkerEvent) {
        // No subscribers is a normal, silent case (broadcast::send errors
        // when the channel has zero receivers).
        let _ = self.tx.send(event);
    }
}

/// Publishes events to a Redis pub/sub channel, for out-of-process
/// observers.
pub struct RedisEventEmitter {
    redis: ConnectionManager,
    channel: String,
}

impl RedisEventEmitter {
    pub fn new(redis: ConnectionManager, job_type: impl AsRef<str>) -> Self {
        Self {
            redis,
            channel: format!("jobs:{}:events", job_type.as_ref()),
        }
    }
}

#[async_trait]
impl EventEmitter for RedisEventEmitter {
    async fn emit(&self, event: WorkerEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize worker event");
                return;
            }
        };

        let mut conn = self.redis.clone();
        let result: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            warn!(error = %e, channel = %self.channel, "failed to publish worker event");
        }
    }
}

/// Fans an event out to more than one emitter — used to publish to Redis
/// while also feeding a local test/metrics subscriber.
pub struct BroadcastEmitter {
    emitters: Vec<std::sync::Arc<dyn EventEmitter>>,
}

impl BroadcastEmitter {
    pub fn new(emitters: Vec<std::sync::Arc<dyn EventEmitter>>) -> Self {
        Self { emitters }
    }
}

#[async_trait]
impl EventEmitter for BroadcastEmitter {
    async fn emit(&self, event: WorkerEvent) {
        for emitter in &self.emitters {
            emitter.emit(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_event_bus_roundtrip() {
        let bus = LocalEventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(WorkerEvent::JobComplete {
            job_type: "email".into(),
            job_id: "1".into(),
            result: Some(serde_json::json!({"sent": true})),
        })
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), Some("1"));
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = WorkerEvent::JobFailed {
            job_type: "email".into(),
            job_id: "1".into(),
            error: "boom".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"job_failed\""));
    }

    #[tokio::test]
    async fn test_no_subscribers_is_benign() {
        let bus = LocalEventBus::new(4);
        bus.emit(WorkerEvent::Error {
            job_type: "email".into(),
            message: "transient".into(),
        })
        .await;
    }
}
