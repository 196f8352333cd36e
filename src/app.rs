use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use renderfarm_core::{AppConfig, ChangeEvent, Clock, SystemClock};
use renderfarm_dispatcher::{
    JobDeleter, JobDeleterConfig, JobService, SleepScheduler, SleepSchedulerConfig,
    StateMachineConfig, TaskScheduler, TaskStateMachine, TimeoutChecker, TimeoutCheckerConfig,
    WorkerService,
};
use renderfarm_domain::JobCompiler;
use renderfarm_infrastructure::{
    ChannelBroadcaster, DatabaseManager, MetricsCollector, TracingTaskLogSink,
};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// 变更事件通道容量
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// 主应用程序：持有数据库、全部服务以及后台循环
pub struct Application {
    config: AppConfig,
    database: Arc<DatabaseManager>,
    broadcaster: Arc<ChannelBroadcaster>,
    job_service: Arc<JobService>,
    worker_service: Arc<WorkerService>,
    job_deleter: Arc<JobDeleter>,
    timeout_checker: Arc<TimeoutChecker>,
    sleep_scheduler: Arc<SleepScheduler>,
}

impl Application {
    /// 打开并校验数据库，装配全部服务
    ///
    /// 数据库完整性检查失败时返回错误，进程不应继续启动。
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化渲染农场管理器");

        let database = Arc::new(
            DatabaseManager::new(&config.database)
                .await
                .with_context(|| format!("打开数据库失败: {}", config.database.url))?,
        );
        database.migrate().await.context("数据库迁移失败")?;
        database
            .integrity_check()
            .await
            .context("数据库完整性检查失败，拒绝启动")?;

        let repos = database.repositories();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let broadcaster = Arc::new(ChannelBroadcaster::new(CHANGE_CHANNEL_CAPACITY));
        let log_sink = Arc::new(TracingTaskLogSink::new(clock.clone()));
        let metrics = Arc::new(MetricsCollector::new().context("创建指标收集器失败")?);

        let state_machine = Arc::new(TaskStateMachine::new(
            repos.clone(),
            log_sink.clone(),
            broadcaster.clone(),
            clock.clone(),
            metrics.clone(),
            StateMachineConfig::from(&config.manager),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            repos.clone(),
            state_machine.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let job_deleter = Arc::new(JobDeleter::new(
            repos.clone(),
            broadcaster.clone(),
            clock.clone(),
            metrics.clone(),
            JobDeleterConfig::from(&config.manager),
        ));
        let job_service = Arc::new(JobService::new(
            repos.clone(),
            Arc::new(JobCompiler::with_builtin_job_types(clock.clone())),
            state_machine.clone(),
            job_deleter.clone(),
            broadcaster.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let worker_service = Arc::new(WorkerService::new(
            repos.clone(),
            state_machine.clone(),
            scheduler,
            log_sink.clone(),
            broadcaster.clone(),
            clock.clone(),
        ));
        let timeout_checker = Arc::new(TimeoutChecker::new(
            repos.clone(),
            state_machine,
            log_sink,
            broadcaster.clone(),
            clock.clone(),
            metrics.clone(),
            TimeoutCheckerConfig::from(&config.manager),
        ));
        let sleep_scheduler = Arc::new(SleepScheduler::new(
            repos,
            broadcaster.clone(),
            clock,
            metrics,
            SleepSchedulerConfig::from(&config.manager),
        ));

        for job_type in job_service.list_job_types()? {
            debug!(
                job_type = %job_type.descriptor.name,
                etag = %job_type.etag,
                "可用的作业类型"
            );
        }

        Ok(Self {
            config,
            database,
            broadcaster,
            job_service,
            worker_service,
            job_deleter,
            timeout_checker,
            sleep_scheduler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    /// 面向作业管理的服务入口
    pub fn job_service(&self) -> Arc<JobService> {
        Arc::clone(&self.job_service)
    }

    /// 面向Worker的服务入口
    pub fn worker_service(&self) -> Arc<WorkerService> {
        Arc::clone(&self.worker_service)
    }

    /// 订阅作业、任务、Worker的变更事件
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.broadcaster.subscribe()
    }

    /// 运行全部后台循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动渲染农场管理器后台服务");

        // 后台循环订阅内部通道，外部关闭信号到达后统一转发
        let (stop_tx, _) = broadcast::channel::<()>(1);

        let timeout_handle = {
            let checker = Arc::clone(&self.timeout_checker);
            let shutdown_rx = stop_tx.subscribe();
            tokio::spawn(async move { checker.run(shutdown_rx).await })
        };

        let sleep_handle = {
            let scheduler = Arc::clone(&self.sleep_scheduler);
            let shutdown_rx = stop_tx.subscribe();
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        };

        let deleter_handle = {
            let deleter = Arc::clone(&self.job_deleter);
            let shutdown_rx = stop_tx.subscribe();
            tokio::spawn(async move { deleter.run(shutdown_rx).await })
        };

        let integrity_handle = {
            let database = Arc::clone(&self.database);
            let interval = Duration::from_secs(self.config.database.integrity_check_interval_seconds);
            let shutdown_rx = stop_tx.subscribe();
            tokio::spawn(async move {
                run_integrity_check_loop(database, interval, shutdown_rx).await;
            })
        };

        let change_log_handle = {
            let changes = self.broadcaster.subscribe();
            let shutdown_rx = stop_tx.subscribe();
            tokio::spawn(async move {
                run_change_log_loop(changes, shutdown_rx).await;
            })
        };

        let _ = shutdown_rx.recv().await;
        info!("渲染农场管理器收到关闭信号");
        let _ = stop_tx.send(());

        let (timeout_result, sleep_result, deleter_result, integrity_result, change_log_result) = tokio::join!(
            timeout_handle,
            sleep_handle,
            deleter_handle,
            integrity_handle,
            change_log_handle
        );
        for (name, result) in [
            ("超时检测", timeout_result),
            ("睡眠计划", sleep_result),
            ("作业删除", deleter_result),
            ("完整性检查", integrity_result),
            ("变更日志", change_log_result),
        ] {
            if let Err(e) = result {
                error!("{}循环异常退出: {}", name, e);
            }
        }

        self.database.close().await;
        info!("渲染农场管理器后台服务已停止");
        Ok(())
    }
}

/// 周期性数据库完整性检查；间隔为0时不运行
async fn run_integrity_check_loop(
    database: Arc<DatabaseManager>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    if period.is_zero() {
        debug!("周期性完整性检查已禁用");
        return;
    }

    // 启动时已经检查过一次，第一次周期检查在一个间隔之后
    let mut interval = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = database.integrity_check().await {
                    error!("周期性数据库完整性检查失败: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("完整性检查循环收到关闭信号");
                break;
            }
        }
    }
}

/// 把变更事件记录到调试日志
async fn run_change_log_loop(
    mut changes: broadcast::Receiver<ChangeEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = changes.recv() => match event {
                Ok(event) => debug!(entity_id = %event.entity_id(), "变更事件: {:?}", event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("变更日志落后，跳过 {} 个事件", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}
