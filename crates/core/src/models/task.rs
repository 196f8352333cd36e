use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务：作业中可被单独调度的执行单元
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    /// 任务类型，用于匹配Worker能力以及黑名单
    pub task_type: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub commands: Vec<Command>,
    pub worker_id: Option<Uuid>,
    /// 最近一次被Worker"触碰"的时间，超时检测以此为准
    pub last_touched_at: Option<DateTime<Utc>>,
    pub activity: String,
    /// 依赖的任务ID，全部成功完成后本任务才可运行
    pub dependencies: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_assigned_to(&self, worker_id: Uuid) -> bool {
        self.worker_id == Some(worker_id)
    }
}

/// 任务中的一条命令，对编排核心而言是不透明的
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl Command {
    pub fn new(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        let parameters = match parameters {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            name: name.into(),
            parameters,
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    SoftFailed,
    CancelRequested,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Queued,
        TaskStatus::Active,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::SoftFailed,
        TaskStatus::CancelRequested,
        TaskStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::SoftFailed => "soft-failed",
            TaskStatus::CancelRequested => "cancel-requested",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// 可以被调度器挑选的状态
    pub fn is_schedulable(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::SoftFailed)
    }

    /// 成功的终态，依赖方可以据此开始运行
    pub fn is_successful_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// 作业重新排队时会被放回队列的状态
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed
                | TaskStatus::SoftFailed
                | TaskStatus::Canceled
                | TaskStatus::CancelRequested
                | TaskStatus::Paused
        )
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("无效的任务状态: {s}"))
    }
}

sqlite_text_enum!(TaskStatus);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_status_parse() {
        assert_eq!("soft-failed".parse::<TaskStatus>().unwrap(), TaskStatus::SoftFailed);
        assert_eq!(TaskStatus::CancelRequested.to_string(), "cancel-requested");
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_schedulable_statuses() {
        assert!(TaskStatus::Queued.is_schedulable());
        assert!(TaskStatus::SoftFailed.is_schedulable());
        assert!(!TaskStatus::Active.is_schedulable());
        assert!(!TaskStatus::Failed.is_schedulable());
    }

    #[test]
    fn test_command_from_non_object_parameters() {
        let cmd = Command::new("echo", json!("not-an-object"));
        assert!(cmd.parameters.is_empty());

        let cmd = Command::new("echo", json!({"message": "hi"}));
        assert_eq!(cmd.parameters["message"], json!("hi"));
    }
}
