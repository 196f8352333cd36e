//! Metrics collector for the render farm manager
//!
//! Counters and histograms are registered through the `metrics` facade; without
//! an installed recorder every call is a no-op, so tests can use it freely.

use anyhow::Result;
use metrics::{counter, histogram, Counter, Histogram};
use tracing::debug;

/// Metrics collector for the orchestration core
pub struct MetricsCollector {
    // Scheduling metrics
    tasks_assigned_total: Counter,
    scheduling_duration: Histogram,
    scheduling_no_task_total: Counter,

    // State machine metrics
    task_status_changes_total: Counter,
    job_status_changes_total: Counter,
    tasks_requeued_total: Counter,

    // Background loop metrics
    task_timeouts_total: Counter,
    worker_timeouts_total: Counter,
    sleep_status_requests_total: Counter,

    // Job lifecycle metrics
    jobs_submitted_total: Counter,
    jobs_deleted_total: Counter,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tasks_assigned_total: counter!("renderfarm_tasks_assigned_total"),
            scheduling_duration: histogram!("renderfarm_scheduling_duration_seconds"),
            scheduling_no_task_total: counter!("renderfarm_scheduling_no_task_total"),
            task_status_changes_total: counter!("renderfarm_task_status_changes_total"),
            job_status_changes_total: counter!("renderfarm_job_status_changes_total"),
            tasks_requeued_total: counter!("renderfarm_tasks_requeued_total"),
            task_timeouts_total: counter!("renderfarm_task_timeouts_total"),
            worker_timeouts_total: counter!("renderfarm_worker_timeouts_total"),
            sleep_status_requests_total: counter!("renderfarm_sleep_status_requests_total"),
            jobs_submitted_total: counter!("renderfarm_jobs_submitted_total"),
            jobs_deleted_total: counter!("renderfarm_jobs_deleted_total"),
        })
    }

    /// Record the outcome of one scheduling attempt
    pub fn record_scheduling(&self, assigned: bool, duration_seconds: f64) {
        self.scheduling_duration.record(duration_seconds);
        if assigned {
            self.tasks_assigned_total.increment(1);
        } else {
            self.scheduling_no_task_total.increment(1);
        }
        debug!(assigned, duration_seconds, "Scheduling attempt finished");
    }

    pub fn record_task_status_change(&self) {
        self.task_status_changes_total.increment(1);
    }

    pub fn record_job_status_change(&self) {
        self.job_status_changes_total.increment(1);
    }

    pub fn record_tasks_requeued(&self, count: u64) {
        self.tasks_requeued_total.increment(count);
    }

    pub fn record_task_timeout(&self) {
        self.task_timeouts_total.increment(1);
    }

    pub fn record_worker_timeout(&self) {
        self.worker_timeouts_total.increment(1);
    }

    pub fn record_sleep_status_request(&self) {
        self.sleep_status_requests_total.increment(1);
    }

    pub fn record_job_submitted(&self) {
        self.jobs_submitted_total.increment(1);
    }

    pub fn record_job_deleted(&self) {
        self.jobs_deleted_total.increment(1);
    }
}
