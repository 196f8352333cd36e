use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::ChangeEvent;
use crate::ManagerResult;

/// 任务日志接收方：向 (作业, 任务) 的日志追加一行带时间戳的文本
#[async_trait]
pub trait TaskLogSink: Send + Sync {
    async fn write_timestamped(&self, job_id: Uuid, task_id: Uuid, text: &str)
        -> ManagerResult<()>;
}

/// 变更广播接口，投递与扇出由实现方负责
pub trait ChangeBroadcaster: Send + Sync {
    fn broadcast(&self, event: ChangeEvent);
}

/// 时间来源
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
