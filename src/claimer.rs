//! The claim step: block for a notification, then atomically pop the
//! highest-priority job id.
//!
//! Races the blocking wait against the lifecycle's cancellation signal
//! instead of a fixed read timeout, so shutdown can interrupt a parked
//! wait without severing the connection.

use crate::broker::BrokerAdapter;
use crate::error::WorkerError;
use crate::job::{Job, JobPayload, JobState};
use crate::lifecycle::{CurrentJob, Lifecycle};
use crate::metrics;
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one claim attempt.
pub enum ClaimOutcome<J> {
    /// A job was popped and loaded; the job is now `Active` in the
    /// store.
    Claimed(Job<J>),
    /// Woke up (notification or poll interval) but nothing was left to
    /// claim.
    NoJob,
    /// Shutdown was requested while waiting; the claim loop should exit.
    Shutdown,
    /// A transient error occurred; the caller should back off before
    /// retrying.
    Error(WorkerError),
}

/// Drives the blocking-wait-then-pop claim protocol for a single job
/// type.
pub struct JobClaimer<J> {
    broker: Arc<BrokerAdapter>,
    store: Arc<dyn JobStore<J>>,
    lifecycle: Arc<Lifecycle<J>>,
    poll_interval: Duration,
    job_type: String,
}

impl<J: JobPayload> JobClaimer<J> {
    pub fn new(
        broker: Arc<BrokerAdapter>,
        store: Arc<dyn JobStore<J>>,
        lifecycle: Arc<Lifecycle<J>>,
        poll_interval: Duration,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            lifecycle,
            poll_interval,
            job_type: job_type.into(),
        }
    }

    /// Attempt to claim one job. Blocks on the notification list (raced
    /// against cancellation) up to `poll_interval`, then, if woken or
    /// timed out, tries the atomic pop once.
    pub async fn claim(&self) -> ClaimOutcome<J> {
        if matches!(self.lifecycle.run_state().await, crate::lifecycle::RunState::ShuttingDown) {
            // Step 1 of the claim protocol: a worker that is already
            // shutting down fails fast rather than parking on a wait that
            // `shutdown`'s one-shot cancellation notify will not repeat.
            return ClaimOutcome::Shutdown;
        }

        self.lifecycle.set_current(CurrentJob::Reserving).await;

        let woke = tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => {
                debug!("claim wait cancelled by shutdown");
                self.lifecycle.set_current(CurrentJob::NoJob).await;
                return ClaimOutcome::Shutdown;
            }
            result = self.broker.wait_for_notification(self.poll_interval) => {
                match result {
                    Ok(woke) => woke,
                    Err(e) => {
                        warn!(error = %e, "error while waiting for claim notification");
                        metrics::record_claim_error(&self.job_type);
                        // Push a recovery token so a peer parked on the
                        // same notification list isn't left stuck forever
                        // because of an error local to this waiter.
                        if let Err(push_err) = self.broker.push_notification().await {
                            warn!(error = %push_err, "failed to push recovery token after claim error");
                        }
                        self.lifecycle.set_current(CurrentJob::NoJob).await;
                        return ClaimOutcome::Error(e);
                    }
                }
            }
        };

        if !woke {
            // Plain poll-interval timeout: loop again rather than treat
            // this as an error.
            self.lifecycle.set_current(CurrentJob::NoJob).await;
            return ClaimOutcome::NoJob;
        }

        let popped = match self.broker.pop_first().await {
            Ok(popped) => popped,
            Err(e) => {
                metrics::record_claim_error(&self.job_type);
                self.lifecycle.set_current(CurrentJob::NoJob).await;
                return ClaimOutcome::Error(e);
            }
        };

        let Some(job_id) = popped else {
            // Woken by a recovery token or a peer that beat us to the
            // pop; nothing left, not an error.
            self.lifecycle.set_current(CurrentJob::NoJob).await;
            return ClaimOutcome::NoJob;
        };

        let job = match self.store.load(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "claimed job id has no stored record");
                self.lifecycle.set_current(CurrentJob::NoJob).await;
                return ClaimOutcome::NoJob;
            }
            Err(e) => {
                self.lifecycle.set_current(CurrentJob::NoJob).await;
                return ClaimOutcome::Error(e);
            }
        };

        let mut job = job;
        job.state = JobState::Active;
        if let Err(e) = self.store.set_state(&job.id, JobState::Active).await {
            self.lifecycle.set_current(CurrentJob::NoJob).await;
            return ClaimOutcome::Error(e);
        }

        debug!(job_id = %job.id, job_type = %job.job_type, "claimed job");
        metrics::record_job_claimed(&self.job_type);
        self.lifecycle
            .set_current(CurrentJob::Holding(job.clone()))
            .await;
        ClaimOutcome::Claimed(job)
    }
}

#[cfg(test)]
mod tests {
    // JobClaimer needs a live BrokerAdapter (backed by a ConnectionManager)
    // to exercise end to end; its branch logic (no-job vs shutdown vs
    // claimed) is covered indirectly through `lifecycle`'s cancellation
    // tests and `runner`'s fake-store based tests.
}
