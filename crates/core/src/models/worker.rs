use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Worker节点信息
///
/// # 字段说明
///
/// * `status_requested` - 管理器请求的目标状态，Worker确认前只是建议
/// * `lazy_status_request` - 为真时等当前任务结束后再切换状态
/// * `supported_task_types` - 逗号分隔的任务类型列表
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub platform: String,
    pub software: String,
    pub status: WorkerStatus,
    pub status_requested: Option<WorkerStatus>,
    pub lazy_status_request: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub can_restart: bool,
    pub supported_task_types: String,
    pub tags: Vec<WorkerTag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    /// 日志中使用的可读标识，格式为 "名称 (UUID)"
    pub fn identifier(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }

    /// 记录一个状态变更请求
    pub fn status_change_request(&mut self, status: WorkerStatus, is_lazy: bool) {
        self.status_requested = Some(status);
        self.lazy_status_request = is_lazy;
    }

    /// 清除待处理的状态变更请求
    pub fn status_change_clear(&mut self) {
        self.status_requested = None;
        self.lazy_status_request = false;
    }

    pub fn has_status_request(&self) -> bool {
        self.status_requested.is_some()
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.supported_task_types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn supports_task_type(&self, task_type: &str) -> bool {
        self.task_types().any(|t| t == task_type)
    }

    pub fn set_task_types<S: AsRef<str>>(&mut self, task_types: &[S]) {
        self.supported_task_types = task_types
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(",");
    }

    pub fn has_tag(&self, tag_id: Uuid) -> bool {
        self.tags.iter().any(|tag| tag.id == tag_id)
    }

    /// 没有标签限制的作业可由任何Worker执行
    pub fn may_run_job_with_tag(&self, job_tag: Option<Uuid>) -> bool {
        match job_tag {
            None => true,
            Some(tag_id) => self.has_tag(tag_id),
        }
    }

    pub fn is_seen_before(&self, cutoff: DateTime<Utc>) -> bool {
        match self.last_seen_at {
            Some(seen) => seen < cutoff,
            None => false,
        }
    }
}

/// Worker状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    Starting,
    Awake,
    Asleep,
    Error,
    Offline,
    Restart,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 6] = [
        WorkerStatus::Starting,
        WorkerStatus::Awake,
        WorkerStatus::Asleep,
        WorkerStatus::Error,
        WorkerStatus::Offline,
        WorkerStatus::Restart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Awake => "awake",
            WorkerStatus::Asleep => "asleep",
            WorkerStatus::Error => "error",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Restart => "restart",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("无效的Worker状态: {s}"))
    }
}

sqlite_text_enum!(WorkerStatus);

/// Worker标签，作业可以限定只在携带某个标签的Worker上运行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerTag {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

impl WorkerTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Worker {
        let now = Utc::now();
        Worker {
            id: Uuid::new_v4(),
            name: "render-01".to_string(),
            address: "10.0.0.1".to_string(),
            platform: "linux".to_string(),
            software: "3.0".to_string(),
            status: WorkerStatus::Awake,
            status_requested: None,
            lazy_status_request: false,
            last_seen_at: Some(now),
            can_restart: false,
            supported_task_types: "blender, ffmpeg,,misc".to_string(),
            tags: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_identifier() {
        let w = worker();
        assert_eq!(w.identifier(), format!("render-01 ({})", w.id));
    }

    #[test]
    fn test_supported_task_types() {
        let mut w = worker();
        assert!(w.supports_task_type("blender"));
        assert!(w.supports_task_type("ffmpeg"));
        assert!(!w.supports_task_type(""));
        assert!(!w.supports_task_type("shell"));

        w.set_task_types(&["shell", " echo "]);
        assert_eq!(w.supported_task_types, "shell,echo");
    }

    #[test]
    fn test_status_change_request_and_clear() {
        let mut w = worker();
        w.status_change_request(WorkerStatus::Asleep, true);
        assert_eq!(w.status_requested, Some(WorkerStatus::Asleep));
        assert!(w.lazy_status_request);

        w.status_change_clear();
        assert!(!w.has_status_request());
        assert!(!w.lazy_status_request);
    }

    #[test]
    fn test_tag_matching() {
        let mut w = worker();
        let tag = WorkerTag::new("gpu");
        assert!(w.may_run_job_with_tag(None));
        assert!(!w.may_run_job_with_tag(Some(tag.id)));

        w.tags.push(tag.clone());
        assert!(w.may_run_job_with_tag(Some(tag.id)));
    }
}
