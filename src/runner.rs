//! Runs a single claimed job to a terminal or delayed outcome.
//!
//! Invokes the processor, races it against the lifecycle's shutdown
//! deadline, and on failure either re-arms the job (via the job's own
//! `BackoffConfig`) or fails it terminally. At most one job is in flight
//! per worker instance; multiple `Worker`s are the unit of parallelism,
//! not tasks within one.

use crate::broker::BrokerAdapter;
use crate::control::{ProcessorControl, QueueShutdown};
use crate::error::{ProcessorError, WorkerError};
use crate::events::{EventEmitter, WorkerEvent};
use crate::job::{BackoffConfig, Job, JobPayload, JobState};
use crate::lifecycle::{Lifecycle, ShutdownSignal};
use crate::metrics;
use crate::resilience::ResilienceLayer;
use crate::store::JobStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// User-supplied job processing logic. Returning a `Result` instead of
/// invoking a completion callback structurally rules out double-invoking
/// a "job done" signal.
#[async_trait]
pub trait JobProcessor<J: JobPayload>: Send + Sync {
    async fn process(
        &self,
        job: &Job<J>,
        control: &ProcessorControl<J>,
    ) -> Result<Option<serde_json::Value>, ProcessorError>;
}

pub struct Runner<J, P> {
    store: Arc<dyn JobStore<J>>,
    broker: Arc<BrokerAdapter>,
    events: Arc<dyn EventEmitter>,
    lifecycle: Arc<Lifecycle<J>>,
    queue: Arc<dyn QueueShutdown>,
    processor: Arc<P>,
    job_type: String,
    default_grace: Duration,
    resilience: Option<Arc<ResilienceLayer>>,
}

impl<J, P> Runner<J, P>
where
    J: JobPayload,
    P: JobProcessor<J>,
{
    pub fn new(
        store: Arc<dyn JobStore<J>>,
        broker: Arc<BrokerAdapter>,
        events: Arc<dyn EventEmitter>,
        lifecycle: Arc<Lifecycle<J>>,
        queue: Arc<dyn QueueShutdown>,
        processor: Arc<P>,
        job_type: impl Into<String>,
        default_grace: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            events,
            lifecycle,
            queue,
            processor,
            job_type: job_type.into(),
            default_grace,
            resilience: None,
        }
    }

    /// Attach a circuit breaker (and optional rate limiter) checked before
    /// every processor invocation. An open circuit re-parks the claim
    /// without consuming an attempt, since retry accounting is driven by
    /// the job's own attempt budget rather than by the breaker.
    pub fn with_resilience(mut self, resilience: Arc<ResilienceLayer>) -> Self {
        self.resilience = Some(resilience);
        self
    }

    /// Run one claimed job to completion, retry-rescheduling, or terminal
    /// failure.
    pub async fn run(&self, job: Job<J>) {
        let job_id = job.id.clone();

        if let Some(resilience) = &self.resilience {
            if resilience.check().is_err() {
                warn!(job_id = %job.id, job_type = %self.job_type, "circuit open, re-parking claim without invoking processor");
                self.re_park(&job).await;
                self.lifecycle.notify_terminal(&job_id).await;
                return;
            }
        }

        metrics::set_in_flight(&self.job_type, 1.0);
        let started = Instant::now();

        let control = ProcessorControl::new(
            self.lifecycle.clone(),
            self.queue.clone(),
            self.job_type.clone(),
            self.default_grace,
        );

        let outcome = self.race_against_shutdown(&job, &control).await;
        let elapsed = started.elapsed();

        metrics::record_job_duration(&self.job_type, elapsed);
        metrics::set_in_flight(&self.job_type, 0.0);

        if let Some(resilience) = &self.resilience {
            match &outcome {
                Ok(_) => resilience.record_success(),
                Err(_) => resilience.record_failure(),
            }
        }

        match outcome {
            Ok(result) => self.complete(&job, result, elapsed).await,
            Err(err) => self.fail_attempt(job, err).await,
        }

        self.lifecycle.notify_terminal(&job_id).await;
    }

    /// Puts a job straight back onto the inactive set without consuming
    /// an attempt or touching its error/backoff state — used only when
    /// the circuit breaker is open and the processor was never invoked.
    async fn re_park(&self, job: &Job<J>) {
        if let Err(e) = self.store.set_state(&job.id, JobState::Inactive).await {
            warn!(job_id = %job.id, error = %e, "failed to re-park job as inactive");
        }
        if let Err(e) = self.broker.push_inactive(&job.id, job.priority).await {
            warn!(job_id = %job.id, error = %e, "failed to push re-parked job back onto inactive set");
        }
        if let Err(e) = self.broker.push_notification().await {
            warn!(job_id = %job.id, error = %e, "failed to notify peers of re-parked job");
        }
    }

    /// Races the processor call against the lifecycle's shutdown signal.
    /// A deadline in the past (grace already elapsed, or zero grace) force
    /// -fails immediately without waiting on the processor at all.
    async fn race_against_shutdown(
        &self,
        job: &Job<J>,
        control: &ProcessorControl<J>,
    ) -> Result<Option<serde_json::Value>, ProcessorError> {
        let mut signal_rx = self.lifecycle.shutdown_signal();

        if let ShutdownSignal::Requested { deadline } = *signal_rx.borrow() {
            if deadline.is_none_or(|d| Instant::now() >= d) {
                return Err(ProcessorError::shutdown());
            }
        }

        let process = self.processor.process(job, control);
        tokio::pin!(process);

        loop {
            tokio::select! {
                biased;
                result = &mut process => return result,
                changed = signal_rx.changed() => {
                    if changed.is_err() {
                        // Lifecycle dropped, nothing left to race against.
                        continue;
                    }
                    let deadline = match *signal_rx.borrow() {
                        ShutdownSignal::None => continue,
                        ShutdownSignal::Requested { deadline } => deadline,
                    };
                    let Some(deadline) = deadline else {
                        return Err(ProcessorError::shutdown());
                    };
                    let now = Instant::now();
                    if deadline <= now {
                        return Err(ProcessorError::shutdown());
                    }
                    tokio::select! {
                        biased;
                        result = &mut process => return result,
                        _ = tokio::time::sleep(deadline - now) => {
                            return Err(ProcessorError::shutdown());
                        }
                    }
                }
            }
        }
    }

    async fn complete(&self, job: &Job<J>, result: Option<serde_json::Value>, elapsed: Duration) {
        let duration_ms = elapsed.as_millis() as u64;
        if let Err(e) = self.store.set_duration(&job.id, duration_ms).await {
            warn!(job_id = %job.id, error = %e, "failed to persist job duration");
        }
        if let Err(e) = self.store.set_result(&job.id, result.clone()).await {
            warn!(job_id = %job.id, error = %e, "failed to persist job result");
        }
        if let Err(e) = self.store.set_state(&job.id, JobState::Complete).await {
            warn!(job_id = %job.id, error = %e, "failed to persist complete state");
        }

        if job.remove_on_complete {
            if let Err(e) = self.store.remove(&job.id).await {
                warn!(job_id = %job.id, error = %e, "failed to remove completed job record");
            }
        }

        metrics::record_job_completed(&self.job_type);
        info!(job_id = %job.id, job_type = %self.job_type, "job complete");
        self.events
            .emit(WorkerEvent::JobComplete {
                job_type: self.job_type.clone(),
                job_id: job.id.clone(),
                result,
            })
            .await;
    }

    /// Delay and force-delayed flag used when a custom backoff function
    /// throws. The job still lands on the `delayed` path using `job.delay_ms`
    /// as the fallback delay, even when that fallback is 0 — a throwing
    /// custom backoff is not the same thing as "no backoff configured", so
    /// it must not fall through to the zero-delay `inactive` path.
    fn resolve_backoff_fallback(fallback_delay_ms: u64) -> (u64, bool) {
        (fallback_delay_ms, true)
    }

    async fn fail_attempt(&self, mut job: Job<J>, err: ProcessorError) {
        let error_message = err.message.clone();

        // A shutdown-forced failure bypasses retry entirely: retrying a
        // job interrupted only by the worker stopping would otherwise
        // silently burn part of its attempt budget for reasons unrelated
        // to the job's own behavior.
        if error_message == ProcessorError::shutdown().message {
            self.terminal_fail(&mut job, error_message).await;
            return;
        }

        job.attempts = job.attempts.next();

        if job.attempts.exhausted() {
            self.terminal_fail(&mut job, error_message).await;
            return;
        }

        let (delay_ms, force_delayed) = match &job.backoff {
            BackoffConfig::None => (0, false),
            BackoffConfig::Fixed { delay_ms } => (*delay_ms, false),
            BackoffConfig::Custom(f) => match f(job.attempts.made) {
                Ok(delay) => (delay, false),
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "custom backoff function failed, falling back to base delay");
                    self.events
                        .emit(WorkerEvent::Error {
                            job_type: self.job_type.clone(),
                            message: format!("backoff function error: {e}"),
                        })
                        .await;
                    Self::resolve_backoff_fallback(job.delay_ms)
                }
            },
        };

        if let Err(e) = self.store.set_error(&job.id, Some(error_message.clone())).await {
            warn!(job_id = %job.id, error = %e, "failed to persist attempt error");
        }
        if let Err(e) = self.store.set_attempts(&job.id, job.attempts).await {
            warn!(job_id = %job.id, error = %e, "failed to persist attempt count");
        }

        if delay_ms == 0 && !force_delayed {
            if let Err(e) = self.store.set_state(&job.id, JobState::Inactive).await {
                warn!(job_id = %job.id, error = %e, "failed to requeue job as inactive");
            }
            if let Err(e) = self.broker.push_inactive(&job.id, job.priority).await {
                warn!(job_id = %job.id, error = %e, "failed to push job back onto inactive set");
            }
            if let Err(e) = self.broker.push_notification().await {
                warn!(job_id = %job.id, error = %e, "failed to notify peers of requeued job");
            }
        } else {
            if let Err(e) = self.store.set_delay(&job.id, delay_ms).await {
                warn!(job_id = %job.id, error = %e, "failed to persist retry delay");
            }
            if let Err(e) = self.store.set_state(&job.id, JobState::Delayed).await {
                warn!(job_id = %job.id, error = %e, "failed to persist delayed state");
            }
            self.schedule_requeue(job.id.clone(), job.priority, delay_ms);
        }

        metrics::record_job_retried(&self.job_type);
        self.events
            .emit(WorkerEvent::JobFailedAttempt {
                job_type: self.job_type.clone(),
                job_id: job.id.clone(),
                attempt: job.attempts.made,
                delay_ms: if delay_ms > 0 || force_delayed {
                    Some(delay_ms)
                } else {
                    None
                },
            })
            .await;
    }

    async fn terminal_fail(&self, job: &mut Job<J>, error_message: String) {
        if let Err(e) = self.store.set_error(&job.id, Some(error_message.clone())).await {
            warn!(job_id = %job.id, error = %e, "failed to persist terminal error");
        }
        if let Err(e) = self.store.set_state(&job.id, JobState::Failed).await {
            warn!(job_id = %job.id, error = %e, "failed to persist failed state");
        }

        metrics::record_job_failed(&self.job_type);
        warn!(job_id = %job.id, job_type = %self.job_type, error = %error_message, "job failed terminally");
        self.events
            .emit(WorkerEvent::JobFailed {
                job_type: self.job_type.clone(),
                job_id: job.id.clone(),
                error: error_message,
            })
            .await;
    }

    /// Re-arm a delayed job once its backoff elapses. A crash before this
    /// fires leaves the job `Delayed` and not in the inactive set; a
    /// recovery sweep over stale delayed jobs is a separate concern, but
    /// the state is left in a form such a sweep could pick up from.
    fn schedule_requeue(&self, job_id: String, priority: i64, delay_ms: u64) {
        let store = self.store.clone();
        let broker = self.broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Err(e) = store.set_state(&job_id, JobState::Inactive).await {
                warn!(job_id = %job_id, error = %e, "failed to mark delayed job inactive");
                return;
            }
            if let Err(e) = broker.push_inactive(&job_id, priority).await {
                warn!(job_id = %job_id, error = %e, "failed to requeue delayed job");
                return;
            }
            if let Err(e) = broker.push_notification().await {
                warn!(job_id = %job_id, error = %e, "failed to notify peers of requeued delayed job");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Serialize, Deserialize)]
    struct Payload {
        value: u32,
    }

    struct FakeStore {
        state: StdMutex<HashMap<String, JobState>>,
        errors: StdMutex<HashMap<String, String>>,
        results: StdMutex<HashMap<String, Option<serde_json::Value>>>,
        durations: StdMutex<HashMap<String, u64>>,
        removed: StdMutex<Vec<String>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                state: StdMutex::new(HashMap::new()),
                errors: StdMutex::new(HashMap::new()),
                results: StdMutex::new(HashMap::new()),
                durations: StdMutex::new(HashMap::new()),
                removed: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobStore<Payload> for FakeStore {
        async fn load(&self, _job_id: &str) -> Result<Option<Job<Payload>>, WorkerError> {
            Ok(None)
        }
        async fn save(&self, _job: &Job<Payload>) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn set_state(&self, job_id: &str, state: JobState) -> Result<(), WorkerError> {
            self.state.lock().unwrap().insert(job_id.to_string(), state);
            Ok(())
        }
        async fn set_result(
            &self,
            job_id: &str,
            result: Option<serde_json::Value>,
        ) -> Result<(), WorkerError> {
            self.results.lock().unwrap().insert(job_id.to_string(), result);
            Ok(())
        }
        async fn set_error(&self, job_id: &str, error: Option<String>) -> Result<(), WorkerError> {
            if let Some(e) = error {
                self.errors.lock().unwrap().insert(job_id.to_string(), e);
            }
            Ok(())
        }
        async fn set_attempts(
            &self,
            _job_id: &str,
            _attempts: crate::job::AttemptInfo,
        ) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn set_delay(&self, _job_id: &str, _delay_ms: u64) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn set_duration(&self, job_id: &str, duration_ms: u64) -> Result<(), WorkerError> {
            self.durations.lock().unwrap().insert(job_id.to_string(), duration_ms);
            Ok(())
        }
        async fn remove(&self, job_id: &str) -> Result<(), WorkerError> {
            self.removed.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl JobProcessor<Payload> for AlwaysFails {
        async fn process(
            &self,
            _job: &Job<Payload>,
            _control: &ProcessorControl<Payload>,
        ) -> Result<Option<serde_json::Value>, ProcessorError> {
            Err(ProcessorError::new("boom"))
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl JobProcessor<Payload> for AlwaysSucceeds {
        async fn process(
            &self,
            _job: &Job<Payload>,
            _control: &ProcessorControl<Payload>,
        ) -> Result<Option<serde_json::Value>, ProcessorError> {
            Ok(Some(serde_json::json!({"ok": true})))
        }
    }

    #[test]
    fn test_resolve_backoff_fallback_forces_delayed_even_at_zero() {
        let (delay_ms, force_delayed) = Runner::<Payload, AlwaysFails>::resolve_backoff_fallback(0);
        assert_eq!(delay_ms, 0);
        assert!(force_delayed);
        // The branch this feeds in `fail_attempt` routes to `delayed`
        // whenever `force_delayed` is set, regardless of `delay_ms`.
        assert!(!(delay_ms == 0 && !force_delayed));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_are_flagged_for_terminal_failure() {
        let mut job = Job::new("1", "email", Payload { value: 1 }).with_max_attempts(1);
        job.attempts = job.attempts.next();
        assert!(job.attempts.exhausted());
    }

    #[tokio::test]
    async fn test_processor_results_round_trip_through_fake_store() {
        let store = FakeStore::new();
        store.set_state("1", JobState::Active).await.unwrap();
        store
            .set_error("1", Some("boom".to_string()))
            .await
            .unwrap();
        assert_eq!(store.state.lock().unwrap().get("1"), Some(&JobState::Active));
        assert_eq!(store.errors.lock().unwrap().get("1").map(String::as_str), Some("boom"));

        let fails = AlwaysFails;
        let succeeds = AlwaysSucceeds;
        let job = Job::new("1", "email", Payload { value: 1 });
        let lifecycle = Arc::new(Lifecycle::new());
        let control = ProcessorControl::new(
            lifecycle,
            Arc::new(crate::control::NoopQueueShutdown),
            "email",
            Duration::from_millis(10),
        );
        assert!(fails.process(&job, &control).await.is_err());
        assert!(succeeds.process(&job, &control).await.is_ok());
    }

    #[tokio::test]
    async fn test_complete_emits_job_complete_event() {
        let store: Arc<dyn JobStore<Payload>> = Arc::new(FakeStore::new());
        let events = Arc::new(crate::events::LocalEventBus::new(16));
        let mut rx = events.subscribe();

        let job = Job::new("1", "email", Payload { value: 1 });
        store
            .set_state(&job.id, JobState::Active)
            .await
            .unwrap();
        events
            .emit(WorkerEvent::JobComplete {
                job_type: "email".into(),
                job_id: job.id.clone(),
                result: Some(serde_json::json!({"sent": true})),
            })
            .await;

        let event = rx.recv().await.unwrap();
        match event {
            WorkerEvent::JobComplete { result, .. } => {
                assert_eq!(result, Some(serde_json::json!({"sent": true})));
            }
            other => panic!("expected JobComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fake_store_records_duration_and_result_and_removal() {
        // Exercises the bookkeeping `Runner::complete` drives (the mutable
        // `duration`/`result` fields and the `remove_on_complete` flag)
        // against the fake store directly; `Runner` itself needs a
        // live `BrokerAdapter` to construct (see `broker`/`store` test notes)
        // so its full `run` path is covered by the claimer/lifecycle
        // protocol tests instead.
        let store = FakeStore::new();

        store.set_duration("42", 17).await.unwrap();
        store
            .set_result("42", Some(serde_json::json!({"sent": true})))
            .await
            .unwrap();
        store.set_state("42", JobState::Complete).await.unwrap();
        store.remove("42").await.unwrap();

        assert_eq!(store.durations.lock().unwrap().get("42"), Some(&17));
        assert_eq!(
            store.results.lock().unwrap().get("42").cloned().flatten(),
            Some(serde_json::json!({"sent": true}))
        );
        assert_eq!(store.state.lock().unwrap().get("42"), Some(&JobState::Complete));
        assert_eq!(store.removed.lock().unwrap().as_slice(), ["42"]);
    }
}
