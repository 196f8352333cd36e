use async_trait::async_trait;
use chrono::SecondsFormat;
use renderfarm_core::{Clock, ManagerResult, TaskLogSink};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// 把任务日志写入 `task_log` target 的tracing事件
///
/// 每行前缀为RFC3339时间戳，与Worker上传的日志格式一致。
pub struct TracingTaskLogSink {
    clock: Arc<dyn Clock>,
}

impl TracingTaskLogSink {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn format_line(&self, text: &str) -> String {
        let now = self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true);
        format!("{now} {text}")
    }
}

#[async_trait]
impl TaskLogSink for TracingTaskLogSink {
    async fn write_timestamped(
        &self,
        job_id: Uuid,
        task_id: Uuid,
        text: &str,
    ) -> ManagerResult<()> {
        let line = self.format_line(text);
        info!(target: "task_log", job_id = %job_id, task_id = %task_id, "{}", line);
        Ok(())
    }
}
