//! Structured logging utilities
//!
//! Lifecycle events of the orchestration core, logged with a stable `event`
//! field so that log pipelines can filter on them.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    /// Log job submission
    pub fn log_job_submitted(job_id: Uuid, job_name: &str, job_type: &str, num_tasks: usize) {
        info!(
            event = "job_submitted",
            job.id = %job_id,
            job.name = job_name,
            job.type = job_type,
            job.num_tasks = num_tasks,
            "Job submitted"
        );
    }

    /// Log job status change
    pub fn log_job_status_change(job_id: Uuid, from: &str, to: &str, reason: &str) {
        info!(
            event = "job_status_change",
            job.id = %job_id,
            job.status.from = from,
            job.status.to = to,
            reason = reason,
            "Job status changed"
        );
    }

    /// Log task status change
    pub fn log_task_status_change(task_id: Uuid, job_id: Uuid, from: &str, to: &str) {
        info!(
            event = "task_status_change",
            task.id = %task_id,
            job.id = %job_id,
            task.status.from = from,
            task.status.to = to,
            "Task status changed"
        );
    }

    /// Log task assignment to a worker
    pub fn log_task_assigned(task_id: Uuid, task_name: &str, job_id: Uuid, worker: &str) {
        info!(
            event = "task_assigned",
            task.id = %task_id,
            task.name = task_name,
            job.id = %job_id,
            worker = worker,
            "Task assigned to worker"
        );
    }

    /// Log a task that was not touched in time
    pub fn log_task_timed_out(task_id: Uuid, job_id: Uuid, worker: &str, untouched_since: DateTime<Utc>) {
        warn!(
            event = "task_timed_out",
            task.id = %task_id,
            job.id = %job_id,
            worker = worker,
            task.untouched_since = %untouched_since,
            "Task timed out"
        );
    }

    /// Log a worker that was not seen in time
    pub fn log_worker_timed_out(worker_id: Uuid, worker_name: &str, last_seen: Option<DateTime<Utc>>) {
        warn!(
            event = "worker_timed_out",
            worker.id = %worker_id,
            worker.name = worker_name,
            worker.last_seen = ?last_seen,
            "Worker timed out"
        );
    }

    /// Log tasks being handed back to the queue
    pub fn log_tasks_requeued(worker_id: Uuid, num_tasks: usize, reason: &str) {
        info!(
            event = "tasks_requeued",
            worker.id = %worker_id,
            num_tasks = num_tasks,
            reason = reason,
            "Requeued tasks of worker"
        );
    }

    /// Log a worker getting blocked from a job's task type
    pub fn log_worker_blocklisted(job_id: Uuid, worker_id: Uuid, task_type: &str) {
        warn!(
            event = "worker_blocklisted",
            job.id = %job_id,
            worker.id = %worker_id,
            task.type = task_type,
            "Worker added to job blocklist"
        );
    }

    /// Log a sleep-schedule driven status request
    pub fn log_sleep_schedule_applied(worker_id: Uuid, from: &str, to: &str) {
        info!(
            event = "sleep_schedule_applied",
            worker.id = %worker_id,
            worker.status.from = from,
            worker.status.requested = to,
            "Sleep schedule requested worker status change"
        );
    }

    /// Log job deletion
    pub fn log_job_deleted(job_id: Uuid) {
        info!(event = "job_deleted", job.id = %job_id, "Job deleted");
    }

    /// Log worker status change
    pub fn log_worker_status_change(worker_id: Uuid, from: &str, to: &str) {
        debug!(
            event = "worker_status_change",
            worker.id = %worker_id,
            worker.status.from = from,
            worker.status.to = to,
            "Worker status changed"
        );
    }
}
