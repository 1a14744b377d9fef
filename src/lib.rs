//! queue-worker - Redis-backed job queue worker core
//!
//! Claims jobs of a named type from a shared broker, drives them through
//! a lifecycle state machine (inactive -> active -> complete | failed |
//! delayed), retries with backoff, emits lifecycle events, and shuts down
//! gracefully without losing in-flight work.
//!
//! # Architecture
//!
//! ```text
//! Redis (jobs:<type>:waiting list, jobs:<type>:inactive zset)
//!   -> BrokerAdapter          two-phase claim primitive
//!   -> JobClaimer             block for notification, pop highest priority
//!   -> Worker::run_loop        claim -> run -> re-arm
//!   -> Runner                 drive one job to a terminal/delayed outcome
//!        -> JobProcessor<J>    user-supplied handler
//! ```
//!
//! # Example usage
//!
//! ```rust,ignore
//! use queue_worker::{Job, JobProcessor, ProcessorControl, ProcessorError, Worker, WorkerConfig};
//! use queue_worker::{LocalEventBus, NoopQueueShutdown, RedisJobStore};
//! use std::sync::Arc;
//!
//! #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! struct EmailProcessor;
//!
//! #[async_trait::async_trait]
//! impl JobProcessor<SendEmail> for EmailProcessor {
//!     async fn process(
//!         &self,
//!         job: &Job<SendEmail>,
//!         _control: &ProcessorControl<SendEmail>,
//!     ) -> Result<Option<serde_json::Value>, ProcessorError> {
//!         // send job.data.to an email...
//!         Ok(Some(serde_json::json!({ "sent": true })))
//!     }
//! }
//!
//! # async fn run(redis: redis::aio::ConnectionManager) {
//! let config = WorkerConfig::new("mail");
//! let store = Arc::new(RedisJobStore::new(redis.clone(), "mail"));
//! let events = Arc::new(LocalEventBus::default());
//! let queue = Arc::new(NoopQueueShutdown);
//! let processor = Arc::new(EmailProcessor);
//!
//! let worker = Arc::new(Worker::new(config, redis, store, events, queue, processor));
//! let handle = worker.clone().start();
//! // ... later, on process shutdown:
//! worker.shutdown(None).await;
//! let _ = handle.await;
//! # }
//! ```

mod broker;
mod claimer;
mod config;
mod control;
mod error;
mod events;
mod health;
mod job;
mod lifecycle;
pub mod metrics;
pub mod resilience;
mod runner;
mod store;
mod worker;

pub use broker::BrokerAdapter;
pub use claimer::{ClaimOutcome, JobClaimer};
pub use config::WorkerConfig;
pub use control::{NoopQueueShutdown, ProcessorControl, QueueShutdown};
pub use error::{ErrorCategory, ProcessorError, WorkerError};
pub use events::{BroadcastEmitter, EventEmitter, LocalEventBus, RedisEventEmitter, WorkerEvent};
pub use health::{
    health_handler, health_router, metrics_handler, queue_info_handler, ready_handler,
    HealthResponse, HealthState,
};
pub use job::{AttemptInfo, BackoffConfig, BackoffFn, Job, JobPayload, JobState};
pub use lifecycle::{CurrentJob, Lifecycle, RunState, SharedLifecycle, ShutdownSignal};
pub use runner::{JobProcessor, Runner};
pub use store::{JobStore, RedisJobStore};
pub use worker::Worker;

/// Result type alias for worker core operations.
pub type WorkerResult<T> = Result<T, WorkerError>;
