//! 后台作业删除
//!
//! 删除请求先持久化到作业的`delete_requested_at`，再放入有界队列。队列满了也没关系，
//! 周期性的重新检查会把遗留的请求再放回队列，Manager重启后同样如此。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use renderfarm_core::{
    ChangeBroadcaster, ChangeEvent, Clock, Job, JobUpdate, ManagerConfig, ManagerError,
    ManagerResult, Repositories,
};
use renderfarm_infrastructure::{MetricsCollector, StructuredLogger};

/// 作业删除配置
#[derive(Debug, Clone)]
pub struct JobDeleterConfig {
    /// 删除队列容量
    pub queue_size: usize,
    /// 重新扫描待删除作业的间隔
    pub recheck_interval: Duration,
}

impl Default for JobDeleterConfig {
    fn default() -> Self {
        Self {
            queue_size: 100,
            recheck_interval: Duration::from_secs(60),
        }
    }
}

impl From<&ManagerConfig> for JobDeleterConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            queue_size: config.job_deletion_queue_size,
            recheck_interval: Duration::from_secs(config.job_deletion_recheck_interval_seconds),
        }
    }
}

pub struct JobDeleter {
    repos: Repositories,
    broadcaster: Arc<dyn ChangeBroadcaster>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: JobDeleterConfig,
    queue_tx: mpsc::Sender<Uuid>,
    queue_rx: Mutex<mpsc::Receiver<Uuid>>,
}

impl JobDeleter {
    pub fn new(
        repos: Repositories,
        broadcaster: Arc<dyn ChangeBroadcaster>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: JobDeleterConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            repos,
            broadcaster,
            clock,
            metrics,
            config,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        }
    }

    /// 标记作业待删除并放入删除队列
    pub async fn queue_job_deletion(&self, job: &mut Job) -> ManagerResult<()> {
        let now = self.clock.now();
        job.delete_requested_at = Some(now);
        job.updated_at = now;
        self.repos.jobs.request_job_deletion(job).await?;
        info!("作业 {} ({}) 已标记为待删除", job.name, job.id);

        self.broadcaster.broadcast(ChangeEvent::Job(JobUpdate::new(job)));
        self.enqueue(job.id);
        Ok(())
    }

    /// 把最后更新时间早于`last_updated_max`的作业全部标记为待删除，返回数量
    ///
    /// 截止时间会向上取整到整秒，这样调用方传入的时间带小数秒时，同一秒内更新的作业也会被包含。
    pub async fn queue_mass_job_deletion(
        &self,
        last_updated_max: DateTime<Utc>,
    ) -> ManagerResult<usize> {
        let cutoff = round_up_to_second(last_updated_max);
        let job_ids = self.repos.jobs.fetch_jobs_last_updated_before(cutoff).await?;
        if job_ids.is_empty() {
            return Err(ManagerError::NoMatchingJobs {
                cutoff: cutoff.to_rfc3339(),
            });
        }

        info!("批量删除：{} 个作业在 {} 之前更新过", job_ids.len(), cutoff);
        let mut num_queued = 0;
        for job_id in job_ids {
            let mut job = match self.repos.fetch_job(job_id).await {
                Ok(job) => job,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if job.is_deletion_requested() {
                continue;
            }
            self.queue_job_deletion(&mut job).await?;
            num_queued += 1;
        }
        Ok(num_queued)
    }

    /// 立即删除作业
    pub async fn delete_job(&self, job_id: Uuid) -> ManagerResult<()> {
        match self.repos.jobs.delete_job(job_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("作业 {} 已经不存在，跳过删除", job_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        StructuredLogger::log_job_deleted(job_id);
        self.metrics.record_job_deleted();
        self.broadcaster
            .broadcast(ChangeEvent::Job(JobUpdate::deleted(job_id, self.clock.now())));
        Ok(())
    }

    /// 把数据库中所有待删除的作业放入队列
    pub async fn queue_pending_deletions(&self) -> ManagerResult<usize> {
        let job_ids = self.repos.jobs.fetch_jobs_deletion_requested().await?;
        let num_pending = job_ids.len();
        if num_pending > 0 {
            debug!("重新排队 {} 个待删除的作业", num_pending);
        }
        for job_id in job_ids {
            if !self.enqueue(job_id) {
                break;
            }
        }
        Ok(num_pending)
    }

    /// 处理删除队列，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("启动作业删除服务");
        let mut queue_rx = self.queue_rx.lock().await;
        let mut recheck = tokio::time::interval(self.config.recheck_interval);

        loop {
            tokio::select! {
                _ = recheck.tick() => {
                    if let Err(e) = self.queue_pending_deletions().await {
                        error!("扫描待删除作业失败: {}", e);
                    }
                }
                Some(job_id) = queue_rx.recv() => {
                    if let Err(e) = self.delete_job(job_id).await {
                        error!("删除作业 {} 失败: {}", job_id, e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，退出作业删除服务");
                    break;
                }
            }
        }
    }

    fn enqueue(&self, job_id: Uuid) -> bool {
        match self.queue_tx.try_send(job_id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("作业删除队列已满，作业 {} 稍后再删除", job_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("作业删除队列已关闭");
                false
            }
        }
    }
}

fn round_up_to_second(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = timestamp
        .duration_trunc(chrono::Duration::seconds(1))
        .unwrap_or(timestamp);
    if truncated == timestamp {
        timestamp
    } else {
        truncated + chrono::Duration::seconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_round_up_to_second() {
        let exact = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();
        assert_eq!(round_up_to_second(exact), exact);

        let fractional = exact + chrono::Duration::milliseconds(250);
        assert_eq!(
            round_up_to_second(fractional),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 6).unwrap()
        );
    }
}
