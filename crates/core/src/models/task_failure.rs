use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 某个Worker执行某个任务失败的记录，(task_id, worker_id) 唯一
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub worker_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// 作业黑名单条目：该Worker不再执行此作业中该类型的任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobBlock {
    pub job_id: Uuid,
    pub worker_id: Uuid,
    pub task_type: String,
}
