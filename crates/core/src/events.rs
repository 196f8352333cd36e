//! 状态变更通知
//!
//! 每次作业、任务、Worker或Worker标签发生变化后，核心都会生成一个事件交给
//! [`ChangeBroadcaster`](crate::traits::ChangeBroadcaster)，分发由广播方负责。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Job, JobStatus, Task, TaskStatus, Worker, WorkerStatus, WorkerTag};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobUpdate {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub previous_status: Option<JobStatus>,
    pub priority: i32,
    pub delete_requested_at: Option<DateTime<Utc>>,
    pub was_deleted: bool,
    /// 作业的任务被批量修改过，订阅方应当重新获取任务列表
    pub refresh_tasks: bool,
    pub updated: DateTime<Utc>,
}

impl JobUpdate {
    pub fn new(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            status: job.status,
            previous_status: None,
            priority: job.priority,
            delete_requested_at: job.delete_requested_at,
            was_deleted: false,
            refresh_tasks: false,
            updated: job.updated_at,
        }
    }

    pub fn with_refresh_tasks(mut self) -> Self {
        self.refresh_tasks = true;
        self
    }

    pub fn with_previous_status(mut self, previous: JobStatus) -> Self {
        self.previous_status = Some(previous);
        self
    }

    /// 作业已被删除时使用的事件
    pub fn deleted(job_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: job_id,
            name: String::new(),
            status: JobStatus::Canceled,
            previous_status: None,
            priority: 0,
            delete_requested_at: None,
            was_deleted: true,
            refresh_tasks: false,
            updated: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskUpdate {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub previous_status: Option<TaskStatus>,
    pub activity: String,
    pub updated: DateTime<Utc>,
}

impl TaskUpdate {
    pub fn new(task: &Task) -> Self {
        Self {
            id: task.id,
            job_id: task.job_id,
            name: task.name.clone(),
            status: task.status,
            previous_status: None,
            activity: task.activity.clone(),
            updated: task.updated_at,
        }
    }

    pub fn with_previous_status(mut self, previous: TaskStatus) -> Self {
        self.previous_status = Some(previous);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerUpdate {
    pub id: Uuid,
    pub name: String,
    pub status: WorkerStatus,
    pub previous_status: Option<WorkerStatus>,
    pub status_requested: Option<WorkerStatus>,
    pub lazy_status_request: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub was_deleted: bool,
    pub updated: DateTime<Utc>,
}

impl WorkerUpdate {
    pub fn new(worker: &Worker) -> Self {
        Self {
            id: worker.id,
            name: worker.name.clone(),
            status: worker.status,
            previous_status: None,
            status_requested: worker.status_requested,
            lazy_status_request: worker.lazy_status_request,
            last_seen: worker.last_seen_at,
            was_deleted: false,
            updated: worker.updated_at,
        }
    }

    pub fn with_previous_status(mut self, previous: WorkerStatus) -> Self {
        self.previous_status = Some(previous);
        self
    }

    pub fn mark_deleted(mut self) -> Self {
        self.was_deleted = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerTagUpdate {
    pub tag: WorkerTag,
    pub was_deleted: bool,
}

/// 广播给界面层的变更事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Job(JobUpdate),
    Task(TaskUpdate),
    Worker(WorkerUpdate),
    WorkerTag(WorkerTagUpdate),
}

impl ChangeEvent {
    /// 事件涉及的实体ID
    pub fn entity_id(&self) -> Uuid {
        match self {
            ChangeEvent::Job(update) => update.id,
            ChangeEvent::Task(update) => update.id,
            ChangeEvent::Worker(update) => update.id,
            ChangeEvent::WorkerTag(update) => update.tag.id,
        }
    }
}
