//! 作业相关的操作：提交、查询、管理员状态修改、优先级、黑名单、删除

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use renderfarm_core::{
    ChangeBroadcaster, ChangeEvent, Clock, Job, JobBlock, JobStatus, JobUpdate, ManagerError,
    ManagerResult, Repositories, Task, TaskStatus,
};
use renderfarm_domain::{AuthoredJob, JobCompiler, JobTypeInfo, SubmittedJob};
use renderfarm_infrastructure::{MetricsCollector, StructuredLogger};

use crate::job_deleter::JobDeleter;
use crate::task_state_machine::TaskStateMachineService;

pub struct JobService {
    repos: Repositories,
    compiler: Arc<JobCompiler>,
    state_machine: Arc<dyn TaskStateMachineService>,
    deleter: Arc<JobDeleter>,
    broadcaster: Arc<dyn ChangeBroadcaster>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl JobService {
    pub fn new(
        repos: Repositories,
        compiler: Arc<JobCompiler>,
        state_machine: Arc<dyn TaskStateMachineService>,
        deleter: Arc<JobDeleter>,
        broadcaster: Arc<dyn ChangeBroadcaster>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            repos,
            compiler,
            state_machine,
            deleter,
            broadcaster,
            clock,
            metrics,
        }
    }

    /// 编译并保存作业，保存后作业进入queued状态
    pub async fn submit_job(&self, submitted: &SubmittedJob) -> ManagerResult<Job> {
        if let Some(tag_id) = submitted.worker_tag_id {
            self.repos.fetch_worker_tag(tag_id).await?;
        }

        let authored = self.compiler.compile(submitted)?;
        let (mut job, tasks) = authored.to_records(self.clock.now());
        self.repos.jobs.store_job(&job, &tasks).await?;

        StructuredLogger::log_job_submitted(job.id, &job.name, &job.job_type, tasks.len());
        self.metrics.record_job_submitted();
        self.broadcaster.broadcast(ChangeEvent::Job(JobUpdate::new(&job)));

        self.state_machine
            .job_status_change(&mut job, JobStatus::Queued, "queued after job submission")
            .await?;
        Ok(job)
    }

    /// 只编译不保存，用于提交前的校验
    pub fn check_job(&self, submitted: &SubmittedJob) -> ManagerResult<AuthoredJob> {
        self.compiler.compile(submitted)
    }

    pub fn list_job_types(&self) -> ManagerResult<Vec<JobTypeInfo>> {
        self.compiler.list_job_types()
    }

    pub fn get_job_type(&self, name: &str) -> ManagerResult<JobTypeInfo> {
        self.compiler.get_job_type(name)
    }

    pub async fn fetch_job(&self, job_id: Uuid) -> ManagerResult<Job> {
        self.repos.fetch_job(job_id).await
    }

    pub async fn list_jobs(&self) -> ManagerResult<Vec<Job>> {
        self.repos.jobs.list_jobs().await
    }

    pub async fn fetch_job_tasks(&self, job_id: Uuid) -> ManagerResult<Vec<Task>> {
        self.repos.fetch_job(job_id).await?;
        self.repos.tasks.fetch_tasks_of_job(job_id).await
    }

    pub async fn fetch_task(&self, task_id: Uuid) -> ManagerResult<Task> {
        self.repos.fetch_task(task_id).await
    }

    /// 管理员修改作业状态
    pub async fn set_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        reason: &str,
    ) -> ManagerResult<Job> {
        let mut job = self.repos.fetch_job(job_id).await?;
        if job.is_deletion_requested() {
            warn!("作业 {} 已请求删除，不能再修改状态", job.id);
            return Err(ManagerError::invalid_transition(
                "作业",
                job.status,
                format!("{status} (待删除)"),
            ));
        }

        info!("管理员修改作业 {} 的状态: {} -> {}", job.id, job.status, status);
        self.state_machine
            .job_status_change(&mut job, status, reason)
            .await?;
        Ok(job)
    }

    pub async fn set_job_priority(&self, job_id: Uuid, priority: i32) -> ManagerResult<Job> {
        let mut job = self.repos.fetch_job(job_id).await?;
        if job.priority == priority {
            return Ok(job);
        }

        job.priority = priority;
        job.updated_at = self.clock.now();
        self.repos.jobs.save_job_priority(&job).await?;
        info!("作业 {} 的优先级改为 {}", job.id, priority);
        self.broadcaster.broadcast(ChangeEvent::Job(JobUpdate::new(&job)));
        Ok(job)
    }

    /// 管理员修改单个任务的状态，只支持重新排队和取消
    pub async fn set_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        reason: &str,
    ) -> ManagerResult<Task> {
        let mut task = self.repos.fetch_task(task_id).await?;
        let job = self.repos.fetch_job(task.job_id).await?;
        if job.is_deletion_requested() {
            return Err(ManagerError::invalid_transition(
                "任务",
                task.status,
                format!("{status} (作业待删除)"),
            ));
        }

        let target = match status {
            TaskStatus::Queued => {
                self.repos.blocklist.clear_failure_list_of_task(task.id).await?;
                TaskStatus::Queued
            }
            TaskStatus::CancelRequested | TaskStatus::Canceled => {
                // 未在运行的任务直接取消
                if task.status == TaskStatus::Active {
                    TaskStatus::CancelRequested
                } else {
                    TaskStatus::Canceled
                }
            }
            other => {
                return Err(ManagerError::invalid_transition("任务", task.status, other));
            }
        };

        task.activity = reason.to_string();
        self.state_machine.task_status_change(&mut task, target).await?;
        Ok(task)
    }

    pub async fn fetch_task_failure_list(&self, task_id: Uuid) -> ManagerResult<Vec<Uuid>> {
        self.repos.fetch_task(task_id).await?;
        self.repos.blocklist.fetch_task_failure_list(task_id).await
    }

    pub async fn fetch_job_blocklist(&self, job_id: Uuid) -> ManagerResult<Vec<JobBlock>> {
        self.repos.fetch_job(job_id).await?;
        self.repos.blocklist.fetch_job_blocklist(job_id).await
    }

    /// 从作业黑名单中移除条目，返回实际移除的数量
    pub async fn remove_from_job_blocklist(
        &self,
        job_id: Uuid,
        entries: &[JobBlock],
    ) -> ManagerResult<u64> {
        let job = self.repos.fetch_job(job_id).await?;
        let entries: Vec<JobBlock> = entries
            .iter()
            .filter(|entry| entry.job_id == job.id)
            .cloned()
            .collect();
        let removed = self.repos.blocklist.remove_from_job_blocklist(&entries).await?;
        info!("从作业 {} 的黑名单中移除了 {} 条记录", job.id, removed);
        Ok(removed)
    }

    /// 请求删除作业，实际删除在后台进行
    pub async fn request_job_deletion(&self, job_id: Uuid) -> ManagerResult<Job> {
        let mut job = self.repos.fetch_job(job_id).await?;
        self.deleter.queue_job_deletion(&mut job).await?;
        Ok(job)
    }

    /// 批量请求删除最后更新早于截止时间的作业
    pub async fn request_mass_job_deletion(
        &self,
        last_updated_max: DateTime<Utc>,
    ) -> ManagerResult<usize> {
        self.deleter.queue_mass_job_deletion(last_updated_max).await
    }
}
