//! The public entry point: a `Worker` wires the broker adapter, job
//! store, claimer, runner and lifecycle controller together and drives
//! the claim loop.
//!
//! `start` spawns one `tokio::task` per worker that loops claim-then-run
//! until shutdown, rather than recursing on each iteration — re-arming is
//! deferred by the loop structure itself, so there is no recursion to
//! bound.

use crate::broker::BrokerAdapter;
use crate::claimer::{ClaimOutcome, JobClaimer};
use crate::config::WorkerConfig;
use crate::control::QueueShutdown;
use crate::events::{EventEmitter, WorkerEvent};
use crate::job::JobPayload;
use crate::lifecycle::{Lifecycle, RunState};
use crate::runner::{JobProcessor, Runner};
use crate::store::JobStore;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A long-lived agent bound to one broker connection and one job type.
pub struct Worker<J, P> {
    config: WorkerConfig,
    broker: Arc<BrokerAdapter>,
    lifecycle: Arc<Lifecycle<J>>,
    claimer: JobClaimer<J>,
    runner: Runner<J, P>,
    events: Arc<dyn EventEmitter>,
    shutdown_started: Mutex<bool>,
}

impl<J, P> Worker<J, P>
where
    J: JobPayload,
    P: JobProcessor<J> + 'static,
{
    /// Assemble a worker from its collaborators. `redis` becomes the
    /// worker's own dedicated (non-shared) client for the blocking
    /// notification wait; only one such connection per type per process
    /// should actually be parked on a wait at a time — callers that run
    /// multiple workers of the same type in one process are responsible
    /// for sharing a single `ConnectionManager` (it multiplexes
    /// internally) or coordinating externally.
    pub fn new(
        config: WorkerConfig,
        redis: ConnectionManager,
        store: Arc<dyn JobStore<J>>,
        events: Arc<dyn EventEmitter>,
        queue: Arc<dyn QueueShutdown>,
        processor: Arc<P>,
    ) -> Self {
        let mut broker = BrokerAdapter::new(redis, &config.job_type);
        if config.notify_key.is_some() || config.inactive_key.is_some() {
            let notify = config
                .notify_key
                .clone()
                .unwrap_or_else(|| format!("jobs:{}:waiting", config.job_type));
            let inactive = config
                .inactive_key
                .clone()
                .unwrap_or_else(|| format!("jobs:{}:inactive", config.job_type));
            broker = broker.with_keys(notify, inactive);
        }
        let broker = Arc::new(broker);

        let lifecycle = Arc::new(Lifecycle::new());

        let claimer = JobClaimer::new(
            broker.clone(),
            store.clone(),
            lifecycle.clone(),
            config.poll_interval(),
            config.job_type.clone(),
        );

        let runner = Runner::new(
            store,
            broker.clone(),
            events.clone(),
            lifecycle.clone(),
            queue,
            processor,
            config.job_type.clone(),
            config.default_grace(),
        );

        Self {
            config,
            broker,
            lifecycle,
            claimer,
            runner,
            events,
            shutdown_started: Mutex::new(false),
        }
    }

    /// Attach a circuit breaker (and optional rate limiter) checked before
    /// every processor invocation.
    pub fn with_resilience(mut self, resilience: Arc<crate::resilience::ResilienceLayer>) -> Self {
        self.runner = self.runner.with_resilience(resilience);
        self
    }

    pub fn job_type(&self) -> &str {
        &self.config.job_type
    }

    /// The broker adapter backing this worker, exposed so a caller can
    /// wire up the queue-depth health endpoint against the same
    /// connection.
    pub fn broker(&self) -> Arc<BrokerAdapter> {
        self.broker.clone()
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle<J>> {
        self.lifecycle.clone()
    }

    /// Start the claim loop as a background task. Idempotent re-entry is
    /// the caller's responsibility: spawning twice would start two
    /// competing loops against the same lifecycle.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!(job_type = %self.config.job_type, consumer_id = %self.config.consumer_id, "starting worker");
        tokio::spawn(async move { self.run_loop().await })
    }

    async fn run_loop(&self) {
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.lifecycle.run_state().await {
                RunState::ShuttingDown => break,
                RunState::Paused => {
                    tokio::select! {
                        _ = self.lifecycle.resumed() => continue,
                        _ = self.lifecycle.cancelled() => break,
                    }
                }
                RunState::Running => {}
            }

            match self.claimer.claim().await {
                ClaimOutcome::Claimed(job) => {
                    backoff = Duration::from_millis(100);
                    self.runner.run(job).await;
                }
                ClaimOutcome::NoJob => {
                    backoff = Duration::from_millis(100);
                }
                ClaimOutcome::Shutdown => break,
                ClaimOutcome::Error(e) => {
                    self.events
                        .emit(WorkerEvent::Error {
                            job_type: self.config.job_type.clone(),
                            message: e.to_string(),
                        })
                        .await;
                    // Only a connection/timeout error warrants backing off
                    // before reconnecting; a malformed record or a
                    // processing-category error isn't fixed by waiting, so
                    // loop straight back into the claim and let it surface
                    // again on its own terms.
                    match e.category() {
                        crate::error::ErrorCategory::Connection
                        | crate::error::ErrorCategory::Timeout => {
                            tokio::time::sleep(backoff).await;
                            let ceiling = Duration::from_millis(self.config.max_reconnect_backoff_ms);
                            backoff = (backoff * 2).min(ceiling);
                        }
                        crate::error::ErrorCategory::Malformed
                        | crate::error::ErrorCategory::Processing => {
                            backoff = Duration::from_millis(100);
                        }
                    }
                }
            }
        }
        debug!(job_type = %self.config.job_type, "claim loop exiting");
    }

    /// Resume a paused worker. Returns `false` (and does not re-arm the
    /// claim loop) if the worker was already running or past the point of
    /// no return in shutdown — the loop wakes on its own the moment a
    /// flip actually happens, so there is nothing further for the caller
    /// to do on `true` either.
    pub async fn resume(&self) -> bool {
        self.lifecycle.resume().await
    }

    /// Graceful shutdown. Idempotent: a second call
    /// while shutdown is already in progress (or complete) is a no-op
    /// with no further broker operations issued.
    pub async fn shutdown(&self, grace: Option<Duration>) {
        {
            let mut started = self.shutdown_started.lock().await;
            if *started {
                debug!(job_type = %self.config.job_type, "shutdown already in progress, ignoring");
                return;
            }
            *started = true;
        }

        let grace = grace.unwrap_or_else(|| self.config.default_grace());
        self.lifecycle.shutdown(grace).await;

        // Step 6: push a recovery token so any peer parked on the shared
        // notification list isn't left stranded, then close the
        // connection this worker owned.
        if let Err(e) = self.broker.push_notification().await {
            warn!(job_type = %self.config.job_type, error = %e, "failed to push recovery token during shutdown");
        }
        self.broker.close().await;

        info!(job_type = %self.config.job_type, "worker shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Payload {
        #[allow(dead_code)]
        value: u32,
    }

    // `Worker::new` needs a live `ConnectionManager`, which this unit test
    // suite cannot construct without a real Redis (the same constraint
    // `broker`/`store` note for their own tests); the run-state transitions
    // the facade relies on are exercised directly against `Lifecycle`
    // instead, end to end coverage of the claim loop lives in integration
    // tests against a real broker.

    #[tokio::test]
    async fn test_resume_false_when_already_running() {
        let lifecycle: Lifecycle<Payload> = Lifecycle::new();
        assert!(!lifecycle.resume().await);
    }

    #[tokio::test]
    async fn test_pause_then_resume_flips_run_state() {
        let lifecycle: Lifecycle<Payload> = Lifecycle::new();
        lifecycle.set_paused().await;
        assert_eq!(lifecycle.run_state().await, RunState::Paused);
        assert!(lifecycle.resume().await);
        assert_eq!(lifecycle.run_state().await, RunState::Running);
    }

    #[tokio::test]
    async fn test_resumed_notify_wakes_immediately() {
        let lifecycle: Arc<Lifecycle<Payload>> = Arc::new(Lifecycle::new());
        lifecycle.set_paused().await;

        let lifecycle_clone = lifecycle.clone();
        let handle = tokio::spawn(async move {
            lifecycle_clone.resumed().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(lifecycle.resume().await);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("resume should wake a waiter parked on resumed()")
            .unwrap();
    }
}
