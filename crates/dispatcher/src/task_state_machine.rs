//! 任务/作业状态机
//!
//! 所有任务和作业状态的修改都必须经过这里：校验转换是否合法、立即持久化、
//! 广播变更，再处理连带后果（失败记录、黑名单、作业状态重新推导、批量级联）。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use renderfarm_core::{
    ChangeBroadcaster, ChangeEvent, Clock, Job, JobStatus, JobUpdate, ManagerConfig, ManagerError,
    ManagerResult, Repositories, Task, TaskLogSink, TaskStatus, TaskUpdate, Worker,
};
use renderfarm_domain::{derive_job_status, job_transition_allowed, task_transition_allowed};
use renderfarm_infrastructure::{MetricsCollector, StructuredLogger};

/// 作业进入这些状态时，仍未结束的任务会被批量取消
const TASK_STATUSES_TO_CANCEL: [TaskStatus; 5] = [
    TaskStatus::Active,
    TaskStatus::Queued,
    TaskStatus::SoftFailed,
    TaskStatus::Paused,
    TaskStatus::CancelRequested,
];

/// 状态机配置
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Worker在同一作业中失败多少个同类型任务后加入黑名单
    pub blocklist_threshold: u32,
    /// 同一作业同一任务类型有多少个不同Worker失败后直接判定任务失败
    pub task_fail_after_softfail_count: u32,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            blocklist_threshold: 3,
            task_fail_after_softfail_count: 3,
        }
    }
}

impl From<&ManagerConfig> for StateMachineConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            blocklist_threshold: config.blocklist_threshold,
            task_fail_after_softfail_count: config.task_fail_after_softfail_count,
        }
    }
}

/// 状态机服务接口
#[async_trait]
pub trait TaskStateMachineService: Send + Sync {
    /// 修改任务状态并处理对作业的影响
    async fn task_status_change(&self, task: &mut Task, new_status: TaskStatus)
        -> ManagerResult<()>;

    /// 修改作业状态并处理对任务的影响
    async fn job_status_change(
        &self,
        job: &mut Job,
        new_status: JobStatus,
        reason: &str,
    ) -> ManagerResult<()>;

    /// 把Worker正在执行的任务放回队列
    async fn requeue_active_tasks_of_worker(&self, worker: &Worker, reason: &str)
        -> ManagerResult<()>;
}

pub struct TaskStateMachine {
    repos: Repositories,
    log_sink: Arc<dyn TaskLogSink>,
    broadcaster: Arc<dyn ChangeBroadcaster>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: StateMachineConfig,
}

impl TaskStateMachine {
    pub fn new(
        repos: Repositories,
        log_sink: Arc<dyn TaskLogSink>,
        broadcaster: Arc<dyn ChangeBroadcaster>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: StateMachineConfig,
    ) -> Self {
        Self {
            repos,
            log_sink,
            broadcaster,
            clock,
            metrics,
            config,
        }
    }

    /// 记录失败并决定任务最终是软失败还是彻底失败
    async fn register_failure(
        &self,
        task: &mut Task,
        worker_id: Uuid,
        requested: TaskStatus,
    ) -> ManagerResult<TaskStatus> {
        let inserted = self
            .repos
            .blocklist
            .add_task_failure(task, worker_id, self.clock.now())
            .await?;
        if !inserted {
            debug!(task_id = %task.id, worker_id = %worker_id, "该Worker已经失败过此任务");
        }

        if requested == TaskStatus::Failed {
            return Ok(TaskStatus::Failed);
        }

        let num_failed_workers = self
            .repos
            .blocklist
            .count_workers_failed_task_type(task.job_id, &task.task_type)
            .await?;
        let threshold = i64::from(self.config.task_fail_after_softfail_count);
        if num_failed_workers >= threshold {
            info!(
                task_id = %task.id,
                job_id = %task.job_id,
                num_failed_workers,
                threshold,
                "失败的Worker数量达到阈值，任务判定为失败"
            );
            task.activity = format!(
                "Task failed by {num_failed_workers} workers, Manager will mark it as hard failure"
            );
            return Ok(TaskStatus::Failed);
        }

        let worker_failures = self
            .repos
            .blocklist
            .count_task_failures_of_worker(task.job_id, worker_id, &task.task_type)
            .await?;
        if worker_failures >= i64::from(self.config.blocklist_threshold) {
            self.repos
                .blocklist
                .add_worker_to_job_blocklist(task.job_id, worker_id, &task.task_type, self.clock.now())
                .await?;
            StructuredLogger::log_worker_blocklisted(task.job_id, worker_id, &task.task_type);
        }

        let job = self.repos.fetch_job(task.job_id).await?;
        let workers_left = self
            .repos
            .blocklist
            .workers_left_to_run(&job, &task.task_type)
            .await?;
        if workers_left.is_empty() {
            info!(
                task_id = %task.id,
                job_id = %task.job_id,
                task_type = %task.task_type,
                "没有可执行该类型任务的Worker了，任务判定为失败"
            );
            task.activity = format!(
                "Task failed, and no workers are left that can run tasks of type {:?}",
                task.task_type
            );
            return Ok(TaskStatus::Failed);
        }

        Ok(TaskStatus::SoftFailed)
    }

    /// 任务状态变化后重新推导作业状态
    async fn update_job_after_task_status_change(
        &self,
        task: &Task,
        old_status: TaskStatus,
    ) -> ManagerResult<()> {
        let mut job = self.repos.fetch_job(task.job_id).await?;
        let counts = self.repos.tasks.count_tasks_of_job_by_status(job.id).await?;
        let derived = derive_job_status(job.status, &counts);
        if derived == job.status {
            return Ok(());
        }

        let reason = format!(
            "task {} changed status {} -> {}",
            task.name, old_status, task.status
        );
        self.job_status_change(&mut job, derived, &reason).await
    }

    /// 持久化一次作业状态转换，不处理后果
    async fn apply_job_status(
        &self,
        job: &mut Job,
        new_status: JobStatus,
        reason: &str,
    ) -> ManagerResult<()> {
        let old_status = job.status;
        if !job_transition_allowed(old_status, new_status) {
            error!(
                job_id = %job.id,
                from = %old_status,
                to = %new_status,
                reason,
                "拒绝非法的作业状态转换"
            );
            return Err(ManagerError::invalid_transition("作业", old_status, new_status));
        }

        job.status = new_status;
        job.activity = format!("Changed to status {new_status:?}: {reason}");
        job.updated_at = self.clock.now();
        self.repos.jobs.save_job_status(job).await.map_err(|err| {
            error!(job_id = %job.id, from = %old_status, to = %new_status, error = %err, "保存作业状态失败");
            err
        })?;

        self.metrics.record_job_status_change();
        StructuredLogger::log_job_status_change(job.id, old_status.as_str(), new_status.as_str(), reason);
        self.broadcaster.broadcast(ChangeEvent::Job(
            JobUpdate::new(job).with_previous_status(old_status),
        ));
        Ok(())
    }

    /// 处理作业状态变化的后果，返回需要继续转换到的状态
    async fn apply_job_consequences(
        &self,
        job: &Job,
        old_status: JobStatus,
    ) -> ManagerResult<Option<(JobStatus, String)>> {
        match job.status {
            JobStatus::CancelRequested => {
                self.cancel_tasks_of_job(job).await?;
                let counts = self.repos.tasks.count_tasks_of_job_by_status(job.id).await?;
                let derived = derive_job_status(job.status, &counts);
                if derived != job.status {
                    return Ok(Some((derived, "all tasks of the job were canceled".to_string())));
                }
                Ok(None)
            }
            JobStatus::Canceled | JobStatus::Failed => {
                self.cancel_tasks_of_job(job).await?;
                Ok(None)
            }
            JobStatus::Requeueing => {
                let requeue_from: Vec<TaskStatus> = if old_status == JobStatus::Completed {
                    TaskStatus::ALL.to_vec()
                } else {
                    TaskStatus::ALL
                        .into_iter()
                        .filter(TaskStatus::is_requeueable)
                        .collect()
                };
                let activity = format!(
                    "Queued because job transitioned status from {old_status} to {}",
                    job.status
                );
                let num_requeued = self
                    .bulk_update_tasks(job, &requeue_from, TaskStatus::Queued, &activity)
                    .await?;
                self.repos.blocklist.clear_failure_list_of_job(job.id).await?;
                self.repos.blocklist.clear_job_blocklist(job.id).await?;
                self.metrics.record_tasks_requeued(num_requeued);
                info!(job_id = %job.id, num_requeued, "作业重新排队，任务已批量放回队列");
                Ok(Some((JobStatus::Queued, "tasks were requeued".to_string())))
            }
            JobStatus::Paused => {
                let activity = "Paused because the job was paused".to_string();
                let num_paused = self
                    .bulk_update_tasks(
                        job,
                        &[TaskStatus::Queued, TaskStatus::SoftFailed],
                        TaskStatus::Paused,
                        &activity,
                    )
                    .await?;
                debug!(job_id = %job.id, num_paused, "作业暂停，排队中的任务已暂停");
                Ok(None)
            }
            JobStatus::Queued | JobStatus::Active if old_status == JobStatus::Paused => {
                let activity = format!("Queued because the job was resumed ({})", job.status);
                self.bulk_update_tasks(job, &[TaskStatus::Paused], TaskStatus::Queued, &activity)
                    .await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn cancel_tasks_of_job(&self, job: &Job) -> ManagerResult<u64> {
        let activity = format!(
            "Manager canceled this task because the job got status {:?}",
            job.status.as_str()
        );
        let num_canceled = self
            .bulk_update_tasks(job, &TASK_STATUSES_TO_CANCEL, TaskStatus::Canceled, &activity)
            .await?;
        info!(job_id = %job.id, num_canceled, status = %job.status, "已批量取消作业的剩余任务");
        Ok(num_canceled)
    }

    /// 批量修改作业中处于 `from` 状态的任务
    ///
    /// 每个受影响的任务都会广播一次任务变更并写入一行任务日志，
    /// 最后广播一次带 `refresh_tasks` 标记的作业变更。
    async fn bulk_update_tasks(
        &self,
        job: &Job,
        from: &[TaskStatus],
        to: TaskStatus,
        activity: &str,
    ) -> ManagerResult<u64> {
        let affected = self
            .repos
            .tasks
            .fetch_tasks_of_job_in_status(job.id, from)
            .await?;
        if affected.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now();
        let num_updated = self
            .repos
            .tasks
            .update_job_task_statuses(job.id, from, to, activity, now)
            .await?;

        for mut task in affected {
            let old_status = task.status;
            task.status = to;
            task.activity = activity.to_string();
            task.updated_at = now;
            self.broadcaster.broadcast(ChangeEvent::Task(
                TaskUpdate::new(&task).with_previous_status(old_status),
            ));

            let log_line = format!("task changed status {old_status} -> {to}: {activity}");
            if let Err(err) = self
                .log_sink
                .write_timestamped(task.job_id, task.id, &log_line)
                .await
            {
                warn!(task_id = %task.id, error = %err, "写入任务日志失败");
            }
        }

        self.broadcaster
            .broadcast(ChangeEvent::Job(JobUpdate::new(job).with_refresh_tasks()));
        Ok(num_updated)
    }
}

#[async_trait]
impl TaskStateMachineService for TaskStateMachine {
    async fn task_status_change(
        &self,
        task: &mut Task,
        new_status: TaskStatus,
    ) -> ManagerResult<()> {
        let old_status = task.status;
        if old_status == new_status {
            debug!(task_id = %task.id, status = %new_status, "任务状态未变化");
            return Ok(());
        }

        if !task_transition_allowed(old_status, new_status) {
            error!(
                task_id = %task.id,
                job_id = %task.job_id,
                from = %old_status,
                to = %new_status,
                "拒绝非法的任务状态转换"
            );
            return Err(ManagerError::invalid_transition("任务", old_status, new_status));
        }
        if new_status == TaskStatus::Active && task.worker_id.is_none() {
            error!(task_id = %task.id, "任务没有分配Worker，不能进入active状态");
            return Err(ManagerError::invalid_transition(
                "任务",
                old_status,
                "active (未分配Worker)",
            ));
        }

        let effective_status = match (new_status, task.worker_id) {
            (TaskStatus::Failed | TaskStatus::SoftFailed, Some(worker_id)) => {
                self.register_failure(task, worker_id, new_status).await?
            }
            _ => new_status,
        };

        task.status = effective_status;
        task.updated_at = self.clock.now();
        self.repos.tasks.save_task(task).await.map_err(|err| {
            error!(
                task_id = %task.id,
                from = %old_status,
                to = %effective_status,
                error = %err,
                "保存任务状态失败"
            );
            err
        })?;

        self.metrics.record_task_status_change();
        StructuredLogger::log_task_status_change(
            task.id,
            task.job_id,
            old_status.as_str(),
            effective_status.as_str(),
        );
        self.broadcaster.broadcast(ChangeEvent::Task(
            TaskUpdate::new(task).with_previous_status(old_status),
        ));

        let log_line = format!("task changed status {old_status} -> {effective_status}");
        if let Err(err) = self
            .log_sink
            .write_timestamped(task.job_id, task.id, &log_line)
            .await
        {
            warn!(task_id = %task.id, error = %err, "写入任务日志失败");
        }

        self.update_job_after_task_status_change(task, old_status).await
    }

    async fn job_status_change(
        &self,
        job: &mut Job,
        new_status: JobStatus,
        reason: &str,
    ) -> ManagerResult<()> {
        let mut next = Some((new_status, reason.to_string()));

        while let Some((status, reason)) = next.take() {
            if job.status == status {
                break;
            }
            let old_status = job.status;
            self.apply_job_status(job, status, &reason).await?;
            next = self.apply_job_consequences(job, old_status).await?;
        }
        Ok(())
    }

    async fn requeue_active_tasks_of_worker(
        &self,
        worker: &Worker,
        reason: &str,
    ) -> ManagerResult<()> {
        let tasks = self
            .repos
            .tasks
            .fetch_tasks_of_worker_in_status(worker.id, TaskStatus::Active)
            .await?;
        if tasks.is_empty() {
            return Ok(());
        }

        StructuredLogger::log_tasks_requeued(worker.id, tasks.len(), reason);

        let activity = format!("Task was requeued by Manager because {reason}");
        let mut last_error = None;
        let mut num_requeued = 0;

        for mut task in tasks {
            task.activity = activity.clone();
            if let Err(err) = self.repos.tasks.save_task_activity(&task).await {
                error!(task_id = %task.id, worker = %worker.identifier(), error = %err, "保存任务活动失败");
                last_error = Some(err);
                continue;
            }

            if let Err(err) = self.task_status_change(&mut task, TaskStatus::Queued).await {
                error!(
                    task_id = %task.id,
                    worker = %worker.identifier(),
                    reason,
                    error = %err,
                    "任务重新排队失败"
                );
                last_error = Some(err);
                continue;
            }
            num_requeued += 1;

            let log_line = format!("{activity}; worker was {}", worker.identifier());
            if let Err(err) = self
                .log_sink
                .write_timestamped(task.job_id, task.id, &log_line)
                .await
            {
                warn!(task_id = %task.id, error = %err, "写入任务日志失败");
            }
        }

        self.metrics.record_tasks_requeued(num_requeued);
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
