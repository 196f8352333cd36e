use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use renderfarm_core::{
    ChangeBroadcaster, ChangeEvent, Clock, ManagerConfig, ManagerResult, Repositories, Task,
    TaskLogSink, TaskStatus, WorkerStatus, WorkerUpdate,
};
use renderfarm_infrastructure::{MetricsCollector, StructuredLogger};

use crate::task_state_machine::TaskStateMachineService;

/// 超时检测配置
#[derive(Debug, Clone)]
pub struct TimeoutCheckerConfig {
    /// 任务多久没有被touch算超时
    pub task_timeout: Duration,
    /// Worker多久没有出现算超时
    pub worker_timeout: Duration,
    /// 启动后第一次检测前的等待时间
    pub initial_delay: Duration,
    /// 检测间隔
    pub check_interval: Duration,
}

impl Default for TimeoutCheckerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),   // 10分钟
            worker_timeout: Duration::from_secs(60),  // 1分钟
            initial_delay: Duration::from_secs(300),  // 给Worker重新连上的时间
            check_interval: Duration::from_secs(60),
        }
    }
}

impl From<&ManagerConfig> for TimeoutCheckerConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            task_timeout: config.task_timeout(),
            worker_timeout: config.worker_timeout(),
            initial_delay: Duration::from_secs(config.timeout_check_initial_delay_seconds),
            check_interval: Duration::from_secs(config.timeout_check_interval_seconds),
        }
    }
}

/// 任务和Worker超时检测
pub struct TimeoutChecker {
    repos: Repositories,
    state_machine: Arc<dyn TaskStateMachineService>,
    log_sink: Arc<dyn TaskLogSink>,
    broadcaster: Arc<dyn ChangeBroadcaster>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: TimeoutCheckerConfig,
}

impl TimeoutChecker {
    pub fn new(
        repos: Repositories,
        state_machine: Arc<dyn TaskStateMachineService>,
        log_sink: Arc<dyn TaskLogSink>,
        broadcaster: Arc<dyn ChangeBroadcaster>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: TimeoutCheckerConfig,
    ) -> Self {
        Self {
            repos,
            state_machine,
            log_sink,
            broadcaster,
            clock,
            metrics,
            config,
        }
    }

    /// 周期性检测，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "启动超时检测，任务超时 {:?}，Worker超时 {:?}",
            self.config.task_timeout, self.config.worker_timeout
        );

        tokio::select! {
            _ = tokio::time::sleep(self.config.initial_delay) => {}
            _ = shutdown_rx.recv() => {
                info!("收到关闭信号，退出超时检测");
                return;
            }
        }

        let mut interval = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.check_timeouts().await,
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，退出超时检测");
                    break;
                }
            }
        }
    }

    /// 执行一轮检测，两类检测互不影响
    pub async fn check_timeouts(&self) {
        if let Err(e) = self.check_task_timeouts().await {
            error!("检测任务超时时出错: {}", e);
        }
        if let Err(e) = self.check_worker_timeouts().await {
            error!("检测Worker超时时出错: {}", e);
        }
    }

    async fn check_task_timeouts(&self) -> ManagerResult<()> {
        let timeout = chrono::Duration::from_std(self.config.task_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let untouched_since = self.clock.now() - timeout;

        let tasks = self.repos.tasks.fetch_timed_out_tasks(untouched_since).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        info!("检测到 {} 个超时任务", tasks.len());

        for task in tasks {
            if let Err(e) = self.time_out_task(task).await {
                error!("处理超时任务时出错: {}", e);
            }
        }
        Ok(())
    }

    async fn time_out_task(&self, mut task: Task) -> ManagerResult<()> {
        let worker_ident = match task.worker_id {
            None => "-unassigned-".to_string(),
            Some(worker_id) => match self.repos.workers.get_worker(worker_id).await {
                Ok(Some(worker)) => worker.identifier(),
                Ok(None) => "-unknown-".to_string(),
                Err(e) => {
                    warn!(task_id = %task.id, worker_id = %worker_id, error = %e, "获取超时任务的Worker失败");
                    "-unknown-".to_string()
                }
            },
        };

        let untouched_since = task.last_touched_at.unwrap_or(task.updated_at);
        StructuredLogger::log_task_timed_out(task.id, task.job_id, &worker_ident, untouched_since);
        self.metrics.record_task_timeout();

        task.activity = format!(
            "Task timed out. It was assigned to worker {}, but untouched since {}",
            worker_ident,
            untouched_since.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        self.repos.tasks.save_task_activity(&task).await?;
        if let Err(e) = self
            .log_sink
            .write_timestamped(task.job_id, task.id, &task.activity)
            .await
        {
            warn!(task_id = %task.id, error = %e, "写入任务日志失败");
        }

        self.state_machine
            .task_status_change(&mut task, TaskStatus::Failed)
            .await
    }

    async fn check_worker_timeouts(&self) -> ManagerResult<()> {
        let timeout = chrono::Duration::from_std(self.config.worker_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let last_seen_before = self.clock.now() - timeout;

        let workers = self
            .repos
            .workers
            .fetch_timed_out_workers(last_seen_before)
            .await?;
        if workers.is_empty() {
            return Ok(());
        }
        info!("检测到 {} 个超时的Worker", workers.len());

        for mut worker in workers {
            StructuredLogger::log_worker_timed_out(worker.id, &worker.name, worker.last_seen_at);
            self.metrics.record_worker_timeout();

            let previous_status = worker.status;
            worker.status = WorkerStatus::Error;
            worker.status_change_clear();
            worker.updated_at = self.clock.now();
            if let Err(e) = self.repos.workers.save_worker_status(&worker).await {
                error!("保存超时Worker {} 的状态时出错: {}", worker.identifier(), e);
                continue;
            }

            if let Err(e) = self
                .state_machine
                .requeue_active_tasks_of_worker(&worker, "worker timed out")
                .await
            {
                error!("Worker {} 的任务重新排队失败: {}", worker.identifier(), e);
            }

            debug!("Worker {} 已标记为error", worker.identifier());
            self.broadcaster.broadcast(ChangeEvent::Worker(
                WorkerUpdate::new(&worker).with_previous_status(previous_status),
            ));
        }
        Ok(())
    }
}
