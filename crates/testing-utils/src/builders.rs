//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use chrono::{DateTime, Utc};
use renderfarm_core::{
    Command, Job, JobStatus, Task, TaskStatus, Worker, WorkerStatus, WorkerTag,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Builder for creating test Job entities
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            job: Job {
                id: Uuid::new_v4(),
                name: "test_job".to_string(),
                job_type: "simple-blender-render".to_string(),
                priority: 50,
                status: JobStatus::Queued,
                activity: String::new(),
                settings: serde_json::Map::new(),
                metadata: HashMap::new(),
                worker_tag_id: None,
                storage_shaman_checkout_id: None,
                delete_requested_at: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.job.name = name.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        self
    }

    pub fn with_worker_tag(mut self, tag_id: Uuid) -> Self {
        self.job.worker_tag_id = Some(tag_id);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.job.updated_at = updated_at;
        self
    }

    pub fn deletion_requested(mut self, at: DateTime<Utc>) -> Self {
        self.job.delete_requested_at = Some(at);
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(job_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            task: Task {
                id: Uuid::new_v4(),
                job_id,
                name: "test_task".to_string(),
                task_type: "blender".to_string(),
                priority: 50,
                status: TaskStatus::Queued,
                commands: vec![Command::new("echo", serde_json::json!({"message": "hi"}))],
                worker_id: None,
                last_touched_at: None,
                activity: String::new(),
                dependencies: vec![],
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.task.task_type = task_type.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.task.dependencies = dependencies;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self.task.updated_at = created_at;
        self
    }

    /// Active and assigned to the worker, last touched at `touched_at`
    pub fn active_on(mut self, worker_id: Uuid, touched_at: DateTime<Utc>) -> Self {
        self.task.status = TaskStatus::Active;
        self.task.worker_id = Some(worker_id);
        self.task.last_touched_at = Some(touched_at);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for creating test Worker entities
pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            worker: Worker {
                id: Uuid::new_v4(),
                name: "test-worker".to_string(),
                address: "192.168.1.10".to_string(),
                platform: "linux".to_string(),
                software: "3.5".to_string(),
                status: WorkerStatus::Awake,
                status_requested: None,
                lazy_status_request: false,
                last_seen_at: Some(now),
                can_restart: false,
                supported_task_types: "blender,ffmpeg,file-management,misc".to_string(),
                tags: vec![],
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.worker.id = id;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.worker.name = name.to_string();
        self
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.worker.status = status;
        self
    }

    pub fn with_status_request(mut self, status: WorkerStatus, is_lazy: bool) -> Self {
        self.worker.status_change_request(status, is_lazy);
        self
    }

    pub fn with_task_types(mut self, task_types: &[&str]) -> Self {
        self.worker.set_task_types(task_types);
        self
    }

    pub fn with_tag(mut self, tag: WorkerTag) -> Self {
        self.worker.tags.push(tag);
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.worker.last_seen_at = Some(last_seen);
        self
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
