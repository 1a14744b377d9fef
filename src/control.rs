//! The control surface handed to a processor while it runs a job.
//!
//! A processor receives a `&ProcessorControl` alongside the job so it can
//! ask the worker to pause or resume — the Rust shape of the JS source's
//! third `control` callback argument.

use crate::error::WorkerError;
use crate::lifecycle::Lifecycle;
use crate::job::JobPayload;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Delegate invoked when a worker pauses itself — the queue-level
/// shutdown primitive `ProcessorControl::pause` defers to. A `Worker`
/// with no external queue to coordinate with can use
/// `NoopQueueShutdown`.
#[async_trait]
pub trait QueueShutdown: Send + Sync {
    async fn shutdown(&self, job_type: &str, grace: Option<Duration>) -> Result<(), WorkerError>;
}

/// Default `QueueShutdown` for a worker running with no external queue
/// coordinator: pausing is purely local.
pub struct NoopQueueShutdown;

#[async_trait]
impl QueueShutdown for NoopQueueShutdown {
    async fn shutdown(&self, _job_type: &str, _grace: Option<Duration>) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// Handed to the user processor for the duration of a single `process`
/// call.
pub struct ProcessorControl<J: JobPayload> {
    lifecycle: Arc<Lifecycle<J>>,
    queue: Arc<dyn QueueShutdown>,
    job_type: String,
    default_grace: Duration,
}

impl<J: JobPayload> ProcessorControl<J> {
    pub fn new(
        lifecycle: Arc<Lifecycle<J>>,
        queue: Arc<dyn QueueShutdown>,
        job_type: impl Into<String>,
        default_grace: Duration,
    ) -> Self {
        Self {
            lifecycle,
            queue,
            job_type: job_type.into(),
            default_grace,
        }
    }

    /// Pause this worker: flips running to paused and delegates to the
    /// queue-level shutdown for this job type, with a grace timeout
    /// (defaulting to 5000ms).
    pub async fn pause(&self, grace: Option<Duration>) -> Result<(), WorkerError> {
        self.lifecycle.set_paused().await;
        let grace = grace.unwrap_or(self.default_grace);
        info!(job_type = %self.job_type, grace_ms = %grace.as_millis(), "processor requested pause");
        self.queue.shutdown(&self.job_type, Some(grace)).await
    }

    /// Resume a paused worker. Returns `true` if the worker was actually
    /// paused (and the claim loop should re-arm), `false` if it was
    /// already running or shutting down.
    pub async fn resume(&self) -> bool {
        self.lifecycle.resume().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_queue_shutdown_always_ok() {
        let queue = NoopQueueShutdown;
        assert!(queue.shutdown("email", Some(Duration::from_millis(10))).await.is_ok());
    }
}
