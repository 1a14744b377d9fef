//! The shutdown and run-state controller shared between a worker's claim
//! loop and runner.
//!
//! Graceful shutdown is modeled as a `current` slot (no job, reserving, or
//! holding one), a grace deadline broadcast over a `watch` channel, and a
//! single "terminal transition" listener that ignores notifications from
//! jobs that raced past shutdown, all built from `tokio::sync` primitives.

use crate::job::Job;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tracing::{debug, info};

/// Coarse run state, checked by the claim loop before it parks on a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    ShuttingDown,
}

/// What a worker is doing right now, the Rust shape of the JS source's
/// `current` field.
pub enum CurrentJob<J> {
    /// Idle, about to block on a notification wait.
    NoJob,
    /// In the claim step: the blocking wait or the atomic pop is in
    /// flight.
    Reserving,
    /// A job was claimed and its processor is running.
    Holding(Job<J>),
}

/// Signal broadcast to the in-flight runner when shutdown begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    None,
    /// Shutdown requested; the runner should force-fail the job in
    /// flight once `deadline` passes. `None` deadline means "no grace at
    /// all" (force-fail immediately).
    Requested { deadline: Option<Instant> },
}

/// Registered once shutdown begins with a job in flight (or reserving),
/// resolved by `Lifecycle::notify_terminal` the moment that job reaches a
/// terminal state. A job id mismatch (an older job racing past shutdown)
/// is left unresolved for the next terminal transition to inspect.
struct ShutdownListener {
    job_id: Option<String>,
    tx: oneshot::Sender<()>,
}

/// Shared shutdown and run-state coordination for a single worker
/// instance.
pub struct Lifecycle<J> {
    run_state: Mutex<RunState>,
    current: Mutex<CurrentJob<J>>,
    listener: Mutex<Option<ShutdownListener>>,
    signal_tx: watch::Sender<ShutdownSignal>,
    signal_rx: watch::Receiver<ShutdownSignal>,
    cancel: Notify,
    resumed: Notify,
}

impl<J> Lifecycle<J> {
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = watch::channel(ShutdownSignal::None);
        Self {
            run_state: Mutex::new(RunState::Running),
            current: Mutex::new(CurrentJob::NoJob),
            listener: Mutex::new(None),
            signal_tx,
            signal_rx,
            cancel: Notify::new(),
            resumed: Notify::new(),
        }
    }

    pub async fn run_state(&self) -> RunState {
        *self.run_state.lock().await
    }

    pub async fn set_paused(&self) {
        let mut state = self.run_state.lock().await;
        if *state == RunState::Running {
            *state = RunState::Paused;
        }
    }

    /// Resume a paused worker. Returns `false` if it wasn't paused
    /// (already running, or shutting down and past the point of no
    /// return).
    pub async fn resume(&self) -> bool {
        let mut state = self.run_state.lock().await;
        if *state == RunState::Paused {
            *state = RunState::Running;
            drop(state);
            self.resumed.notify_waiters();
            true
        } else {
            false
        }
    }

    /// A future that resolves the moment `resume` flips the run state,
    /// for the claim loop to wake on immediately instead of polling on a
    /// fixed interval while paused.
    pub async fn resumed(&self) {
        self.resumed.notified().await;
    }

    pub async fn set_current(&self, current: CurrentJob<J>) {
        *self.current.lock().await = current;
    }

    /// A future that resolves the moment shutdown begins, for the claim
    /// loop to race a blocking wait against. This is the Rust stand-in
    /// for "close the connection to unblock the raw wait" — cooperative
    /// cancellation instead of severing a shared connection.
    pub async fn cancelled(&self) {
        self.cancel.notified().await;
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<ShutdownSignal> {
        self.signal_rx.clone()
    }

    /// Begin graceful shutdown. If a job is currently in flight (or being
    /// reserved), waits up to `grace` for it to reach a terminal state
    /// before returning; a job merely reserving is cancelled instead of
    /// waited on, since it hasn't claimed anything yet.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.run_state.lock().await;
            *state = RunState::ShuttingDown;
        }

        self.cancel.notify_waiters();

        let deadline = if grace.is_zero() {
            None
        } else {
            Some(Instant::now() + grace)
        };
        let _ = self.signal_tx.send(ShutdownSignal::Requested { deadline });

        let waiter = {
            let mut current = self.current.lock().await;
            match &*current {
                CurrentJob::NoJob => None,
                CurrentJob::Reserving => {
                    // Nothing claimed yet: cancellation above is enough,
                    // there is no terminal transition to wait for.
                    *current = CurrentJob::NoJob;
                    None
                }
                CurrentJob::Holding(job) => {
                    let job_id = job.id.clone();
                    let (tx, rx) = oneshot::channel();
                    *self.listener.lock().await = Some(ShutdownListener {
                        job_id: Some(job_id),
                        tx,
                    });
                    Some(rx)
                }
            }
        };

        if let Some(rx) = waiter {
            info!("waiting for in-flight job to reach a terminal state");
            // The runner races the same deadline internally and force-fails
            // the job at or before it elapses, which resolves `rx` via
            // `notify_terminal`. This wait is not itself bounded by `grace`
            // a second time — doing so would let `shutdown` return before
            // the force-fail's terminal transition actually lands. A
            // generous safety margin on top of the deadline guards only
            // against a runner bug, not against the documented protocol.
            let safety_bound = deadline
                .map(|d| d + Duration::from_secs(2))
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(2));
            let remaining = safety_bound.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, rx).await.is_err() {
                debug!("in-flight job did not reach a terminal state within the safety margin");
            }
        }

        debug!("lifecycle shutdown complete");
    }

    /// Called by the runner whenever a job reaches complete, failed or
    /// delayed. Resolves a pending shutdown listener if one is waiting on
    /// this exact job id; a listener registered for a different job (one
    /// that was already replaced by the time shutdown began checking) is
    /// left in place.
    pub async fn notify_terminal(&self, job_id: &str) {
        let mut slot = self.listener.lock().await;
        let resolved = match slot.take() {
            Some(listener) if listener.job_id.as_deref() == Some(job_id) => {
                let _ = listener.tx.send(());
                true
            }
            Some(listener) => {
                *slot = Some(listener);
                false
            }
            None => false,
        };
        if resolved {
            *self.current.lock().await = CurrentJob::NoJob;
        }
    }
}

impl<J> Default for Lifecycle<J> {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedLifecycle<J> = Arc<Lifecycle<J>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Payload {
        value: u32,
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let lifecycle: Lifecycle<Payload> = Lifecycle::new();
        assert_eq!(lifecycle.run_state().await, RunState::Running);
        lifecycle.set_paused().await;
        assert_eq!(lifecycle.run_state().await, RunState::Paused);
        assert!(lifecycle.resume().await);
        assert_eq!(lifecycle.run_state().await, RunState::Running);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_job_returns_immediately() {
        let lifecycle: Lifecycle<Payload> = Lifecycle::new();
        lifecycle.shutdown(Duration::from_millis(50)).await;
        assert_eq!(lifecycle.run_state().await, RunState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_holding_job_then_resolves() {
        let lifecycle: Arc<Lifecycle<Payload>> = Arc::new(Lifecycle::new());
        let job = Job::new("1", "email", Payload { value: 1 });
        lifecycle.set_current(CurrentJob::Holding(job)).await;

        let lifecycle_clone = lifecycle.clone();
        let handle = tokio::spawn(async move {
            lifecycle_clone.shutdown(Duration::from_secs(5)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        lifecycle.notify_terminal("1").await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("shutdown should resolve once the job terminates")
            .unwrap();
    }

    #[tokio::test]
    async fn test_notify_terminal_ignores_mismatched_job_id() {
        let lifecycle: Lifecycle<Payload> = Lifecycle::new();
        let job = Job::new("1", "email", Payload { value: 1 });
        lifecycle.set_current(CurrentJob::Holding(job)).await;

        let (tx, _rx) = oneshot::channel();
        *lifecycle.listener.lock().await = Some(ShutdownListener {
            job_id: Some("1".into()),
            tx,
        });

        lifecycle.notify_terminal("2").await;
        assert!(lifecycle.listener.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_notifies_waiters() {
        let lifecycle: Arc<Lifecycle<Payload>> = Arc::new(Lifecycle::new());
        let lifecycle_clone = lifecycle.clone();
        let handle = tokio::spawn(async move {
            lifecycle_clone.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.shutdown(Duration::ZERO).await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancellation should wake the waiter")
            .unwrap();
    }
}
