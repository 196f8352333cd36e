use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 编排核心的运行参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// 任务多久未被触碰即视为超时
    pub task_timeout_seconds: u64,
    /// Worker多久未出现即视为超时
    pub worker_timeout_seconds: u64,
    /// Worker在同一作业中失败多少个同类型任务后被加入黑名单
    pub blocklist_threshold: u32,
    /// 同一作业同一任务类型有多少个不同Worker失败后任务直接判定为失败
    pub task_fail_after_softfail_count: u32,
    pub timeout_check_initial_delay_seconds: u64,
    pub timeout_check_interval_seconds: u64,
    pub sleep_check_initial_delay_seconds: u64,
    pub sleep_check_interval_seconds: u64,
    /// 待删除作业队列的容量
    pub job_deletion_queue_size: usize,
    pub job_deletion_recheck_interval_seconds: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            task_timeout_seconds: 600,
            worker_timeout_seconds: 60,
            blocklist_threshold: 3,
            task_fail_after_softfail_count: 3,
            timeout_check_initial_delay_seconds: 300,
            timeout_check_interval_seconds: 60,
            sleep_check_initial_delay_seconds: 2,
            sleep_check_interval_seconds: 60,
            job_deletion_queue_size: 100,
            job_deletion_recheck_interval_seconds: 60,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        if self.worker_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Worker超时时间必须大于0"));
        }

        if self.blocklist_threshold == 0 {
            return Err(anyhow::anyhow!("黑名单阈值必须大于0"));
        }

        if self.task_fail_after_softfail_count == 0 {
            return Err(anyhow::anyhow!("软失败次数阈值必须大于0"));
        }

        if self.timeout_check_interval_seconds == 0 || self.sleep_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("检查间隔必须大于0"));
        }

        if self.job_deletion_queue_size == 0 {
            return Err(anyhow::anyhow!("作业删除队列容量必须大于0"));
        }

        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_seconds)
    }
}
