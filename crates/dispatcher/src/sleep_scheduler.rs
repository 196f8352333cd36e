//! Worker睡眠计划
//!
//! 睡眠计划按Manager本地时间解释。到达计划时间时，向Worker发出非惰性的
//! awake/asleep状态请求；处于error状态的Worker不受计划影响。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use renderfarm_core::{
    ChangeBroadcaster, ChangeEvent, Clock, ManagerConfig, ManagerError, ManagerResult,
    Repositories, SleepSchedule, Worker, WorkerStatus, WorkerUpdate,
};
use renderfarm_domain::sleep_schedule::{
    calculate_next_check, normalize_schedule, scheduled_worker_status,
};
use renderfarm_infrastructure::{MetricsCollector, StructuredLogger};

/// 睡眠计划检测配置
#[derive(Debug, Clone)]
pub struct SleepSchedulerConfig {
    pub initial_delay: Duration,
    pub check_interval: Duration,
}

impl Default for SleepSchedulerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            check_interval: Duration::from_secs(60),
        }
    }
}

impl From<&ManagerConfig> for SleepSchedulerConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.sleep_check_initial_delay_seconds),
            check_interval: Duration::from_secs(config.sleep_check_interval_seconds),
        }
    }
}

pub struct SleepScheduler {
    repos: Repositories,
    broadcaster: Arc<dyn ChangeBroadcaster>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: SleepSchedulerConfig,
}

impl SleepScheduler {
    pub fn new(
        repos: Repositories,
        broadcaster: Arc<dyn ChangeBroadcaster>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: SleepSchedulerConfig,
    ) -> Self {
        Self {
            repos,
            broadcaster,
            clock,
            metrics,
            config,
        }
    }

    /// 获取Worker的睡眠计划
    pub async fn fetch_schedule(&self, worker_id: Uuid) -> ManagerResult<SleepSchedule> {
        self.repos
            .sleep_schedules
            .fetch_sleep_schedule(worker_id)
            .await?
            .ok_or(ManagerError::SleepScheduleNotFound { worker_id })
    }

    /// 保存睡眠计划并立即生效
    pub async fn set_schedule(
        &self,
        worker_id: Uuid,
        mut schedule: SleepSchedule,
    ) -> ManagerResult<SleepSchedule> {
        let worker = self.repos.fetch_worker(worker_id).await?;

        schedule.worker_id = worker_id;
        normalize_schedule(&mut schedule);
        schedule.next_check = Some(self.next_check(&schedule));

        self.repos.sleep_schedules.save_sleep_schedule(&schedule).await?;
        info!(
            "Worker {} 的睡眠计划已更新: 启用={} 日期='{}'",
            worker.identifier(),
            schedule.is_active,
            schedule.days_of_week
        );

        self.apply_sleep_schedule(worker, &schedule).await?;
        Ok(schedule)
    }

    /// 根据计划，此刻Worker应处于的状态
    pub async fn worker_status(&self, worker_id: Uuid) -> ManagerResult<WorkerStatus> {
        let schedule = self
            .repos
            .sleep_schedules
            .fetch_sleep_schedule(worker_id)
            .await?;
        Ok(scheduled_worker_status(self.local_now(), schedule.as_ref()))
    }

    /// 检查所有到期的睡眠计划
    pub async fn check_schedules(&self) -> ManagerResult<()> {
        let now = self.clock.now();
        let schedules = self
            .repos
            .sleep_schedules
            .fetch_sleep_schedules_to_check(now)
            .await?;
        if schedules.is_empty() {
            return Ok(());
        }
        debug!("需要检查 {} 个睡眠计划", schedules.len());

        for mut schedule in schedules {
            schedule.next_check = Some(self.next_check(&schedule));
            if let Err(e) = self
                .repos
                .sleep_schedules
                .save_sleep_schedule_next_check(&schedule)
                .await
            {
                error!("保存Worker {} 的下次检查时间失败: {}", schedule.worker_id, e);
                continue;
            }

            let worker = match self.repos.fetch_worker(schedule.worker_id).await {
                Ok(worker) => worker,
                Err(e) if e.is_not_found() => {
                    debug!("睡眠计划对应的Worker {} 已不存在", schedule.worker_id);
                    continue;
                }
                Err(e) => {
                    error!("获取Worker {} 失败: {}", schedule.worker_id, e);
                    continue;
                }
            };

            if let Err(e) = self.apply_sleep_schedule(worker, &schedule).await {
                error!("应用Worker {} 的睡眠计划失败: {}", schedule.worker_id, e);
            }
        }
        Ok(())
    }

    /// 周期性检查，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("启动睡眠计划检测");

        tokio::select! {
            _ = tokio::time::sleep(self.config.initial_delay) => {}
            _ = shutdown_rx.recv() => return,
        }

        let mut interval = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_schedules().await {
                        error!("检查睡眠计划时出错: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，退出睡眠计划检测");
                    break;
                }
            }
        }
    }

    async fn apply_sleep_schedule(
        &self,
        mut worker: Worker,
        schedule: &SleepSchedule,
    ) -> ManagerResult<()> {
        if worker.status == WorkerStatus::Error {
            debug!("Worker {} 处于error状态，不应用睡眠计划", worker.identifier());
            return Ok(());
        }

        let scheduled = scheduled_worker_status(self.local_now(), Some(schedule));
        let already_requested =
            worker.status_requested == Some(scheduled) && !worker.lazy_status_request;
        let already_there = worker.status == scheduled && !worker.has_status_request();
        if already_requested || already_there {
            return Ok(());
        }

        let previous_status = worker.status;
        worker.status_change_request(scheduled, false);
        worker.updated_at = self.clock.now();
        self.repos.workers.save_worker_status(&worker).await?;

        self.metrics.record_sleep_status_request();
        StructuredLogger::log_sleep_schedule_applied(
            worker.id,
            previous_status.as_str(),
            scheduled.as_str(),
        );
        self.broadcaster.broadcast(ChangeEvent::Worker(WorkerUpdate::new(&worker)));
        Ok(())
    }

    fn local_now(&self) -> NaiveDateTime {
        self.clock.now().with_timezone(&Local).naive_local()
    }

    fn next_check(&self, schedule: &SleepSchedule) -> DateTime<Utc> {
        let next_local = calculate_next_check(self.local_now(), schedule);
        Local
            .from_local_datetime(&next_local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&next_local))
    }
}
