//! Metrics for worker core observability.
//!
//! A `metrics` + `OnceLock` Prometheus handle, with names kept in a
//! `names` module: claimed/completed/failed/retried counters labeled by
//! job type, a duration histogram, and an in-flight gauge.
//!
//! ## Available metrics
//!
//! - `worker_jobs_claimed_total` - counter of jobs claimed, by job type
//! - `worker_jobs_completed_total` - counter of jobs completed, by job type
//! - `worker_jobs_failed_total` - counter of jobs terminally failed, by job type
//! - `worker_jobs_retried_total` - counter of retry attempts scheduled, by job type
//! - `worker_job_duration_seconds` - histogram of job processing time, by job type
//! - `worker_in_flight_jobs` - gauge, 0 or 1 per worker instance
//! - `worker_claim_errors_total` - counter of errors encountered while claiming

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const JOBS_CLAIMED: &str = "worker_jobs_claimed_total";
    pub const JOBS_COMPLETED: &str = "worker_jobs_completed_total";
    pub const JOBS_FAILED: &str = "worker_jobs_failed_total";
    pub const JOBS_RETRIED: &str = "worker_jobs_retried_total";
    pub const JOB_DURATION: &str = "worker_job_duration_seconds";
    pub const IN_FLIGHT: &str = "worker_in_flight_jobs";
    pub const CLAIM_ERRORS: &str = "worker_claim_errors_total";
}

/// Install the global Prometheus recorder. Should be called once at
/// startup; subsequent calls return the same handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_job_claimed(job_type: &str) {
    counter!(names::JOBS_CLAIMED, "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_completed(job_type: &str) {
    counter!(names::JOBS_COMPLETED, "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_failed(job_type: &str) {
    counter!(names::JOBS_FAILED, "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_retried(job_type: &str) {
    counter!(names::JOBS_RETRIED, "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_duration(job_type: &str, duration: Duration) {
    histogram!(names::JOB_DURATION, "job_type" => job_type.to_string()).record(duration.as_secs_f64());
}

pub fn set_in_flight(job_type: &str, value: f64) {
    gauge!(names::IN_FLIGHT, "job_type" => job_type.to_string()).set(value);
}

pub fn record_claim_error(job_type: &str) {
    counter!(names::CLAIM_ERRORS, "job_type" => job_type.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_distinct() {
        let all = [
            names::JOBS_CLAIMED,
            names::JOBS_COMPLETED,
            names::JOBS_FAILED,
            names::JOBS_RETRIED,
            names::JOB_DURATION,
            names::IN_FLIGHT,
            names::CLAIM_ERRORS,
        ];
        let mut seen = std::collections::HashSet::new();
        for name in all {
            assert!(seen.insert(name), "duplicate metric name: {name}");
        }
    }
}
