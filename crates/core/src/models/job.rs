use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 渲染作业
///
/// 作业拥有其全部任务，删除作业会级联删除任务、依赖关系和失败记录。
///
/// # 字段说明
///
/// * `priority` - 优先级，数值越大越紧急
/// * `worker_tag_id` - 限定只能由携带该标签的Worker执行，为空表示不限制
/// * `storage_shaman_checkout_id` - 存储检出引用
/// * `delete_requested_at` - 删除请求时间，非空表示"等待删除"
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub job_type: String,
    pub priority: i32,
    pub status: JobStatus,
    pub activity: String,
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub metadata: HashMap<String, String>,
    pub worker_tag_id: Option<Uuid>,
    pub storage_shaman_checkout_id: Option<String>,
    pub delete_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// 是否已请求删除
    pub fn is_deletion_requested(&self) -> bool {
        self.delete_requested_at.is_some()
    }
}

/// 作业状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    UnderConstruction,
    ConstructionFailed,
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    CancelRequested,
    Canceled,
    Requeueing,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::UnderConstruction,
        JobStatus::ConstructionFailed,
        JobStatus::Queued,
        JobStatus::Active,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::CancelRequested,
        JobStatus::Canceled,
        JobStatus::Requeueing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::UnderConstruction => "under-construction",
            JobStatus::ConstructionFailed => "construction-failed",
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::CancelRequested => "cancel-requested",
            JobStatus::Canceled => "canceled",
            JobStatus::Requeueing => "requeueing",
        }
    }

    /// 作业是否处于可以被调度的状态
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Active)
    }

    /// 作业是否已经结束，不会再有任务被执行
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Canceled
                | JobStatus::ConstructionFailed
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("无效的作业状态: {s}"))
    }
}

sqlite_text_enum!(JobStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_string_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_serde_matches_as_str() {
        let json = serde_json::to_string(&JobStatus::CancelRequested).unwrap();
        assert_eq!(json, "\"cancel-requested\"");
    }

    #[test]
    fn test_runnable_statuses() {
        assert!(JobStatus::Queued.is_runnable());
        assert!(JobStatus::Active.is_runnable());
        assert!(!JobStatus::Paused.is_runnable());
        assert!(!JobStatus::UnderConstruction.is_runnable());
    }
}
