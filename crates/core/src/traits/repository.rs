//! 数据仓储层接口定义
//!
//! 此模块定义了持久化层的核心抽象接口，包括：
//! - 作业仓储接口 (JobRepository)
//! - 任务仓储接口 (TaskRepository)
//! - 失败记录与黑名单仓储接口 (BlocklistRepository)
//! - Worker与Worker标签仓储接口 (WorkerRepository, WorkerTagRepository)
//! - 睡眠计划仓储接口 (SleepScheduleRepository)
//!
//! ## 设计原则
//!
//! ### 接口隔离
//! 每个仓储接口只负责一类实体。跨表的原子操作（保存作业及其任务、
//! 删除作业及其全部子记录）由实现方在单个事务中完成。
//!
//! ### 错误语义
//! - 查询单个实体时返回 `Option`，由调用方转换为对应的 NotFound 错误
//! - 更新不存在的实体返回对应的 NotFound 错误
//! - 存储繁忙时返回 `ManagerError::StoreBusy`，调用方可稍后重试
//!
//! ### 取消
//! 所有方法都是 `async` 的，丢弃返回的 Future 即取消操作；
//! 需要超时的调用方使用 `tokio::time::timeout` 包裹。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use renderfarm_core::traits::TaskRepository;
//!
//! async fn requeue_candidates(repo: &dyn TaskRepository, job_id: Uuid) -> ManagerResult<usize> {
//!     let failed = repo
//!         .fetch_tasks_of_job_in_status(job_id, &[TaskStatus::Failed])
//!         .await?;
//!     Ok(failed.len())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Job, JobBlock, SleepSchedule, Task, TaskStatus, Worker, WorkerTag};
use crate::ManagerResult;

/// 作业仓储接口
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 在单个事务中保存作业、它的全部任务以及任务间的依赖关系
    async fn store_job(&self, job: &Job, tasks: &[Task]) -> ManagerResult<()>;

    async fn get_job(&self, job_id: Uuid) -> ManagerResult<Option<Job>>;

    async fn list_jobs(&self) -> ManagerResult<Vec<Job>>;

    /// 保存作业状态与活动描述，同时刷新 `updated_at`
    async fn save_job_status(&self, job: &Job) -> ManagerResult<()>;

    async fn save_job_priority(&self, job: &Job) -> ManagerResult<()>;

    /// 保存作业的删除请求时间
    async fn request_job_deletion(&self, job: &Job) -> ManagerResult<()>;

    /// 已请求删除但尚未删除的作业
    async fn fetch_jobs_deletion_requested(&self) -> ManagerResult<Vec<Uuid>>;

    /// 最后更新时间早于 `cutoff` 的作业
    async fn fetch_jobs_last_updated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> ManagerResult<Vec<Uuid>>;

    /// 在单个事务中删除作业及其任务、依赖关系、失败记录和黑名单
    async fn delete_job(&self, job_id: Uuid) -> ManagerResult<()>;
}

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, task_id: Uuid) -> ManagerResult<Option<Task>>;

    /// 保存任务的可变字段：状态、Worker、活动、触碰时间、优先级
    async fn save_task(&self, task: &Task) -> ManagerResult<()>;

    async fn save_task_activity(&self, task: &Task) -> ManagerResult<()>;

    /// 记录Worker对任务的"触碰"
    async fn touch_task(&self, task_id: Uuid, now: DateTime<Utc>) -> ManagerResult<()>;

    async fn fetch_tasks_of_job(&self, job_id: Uuid) -> ManagerResult<Vec<Task>>;

    async fn fetch_tasks_of_job_in_status(
        &self,
        job_id: Uuid,
        statuses: &[TaskStatus],
    ) -> ManagerResult<Vec<Task>>;

    async fn fetch_tasks_of_worker_in_status(
        &self,
        worker_id: Uuid,
        status: TaskStatus,
    ) -> ManagerResult<Vec<Task>>;

    /// 按状态统计作业的任务数量
    async fn count_tasks_of_job_by_status(
        &self,
        job_id: Uuid,
    ) -> ManagerResult<HashMap<TaskStatus, i64>>;

    /// 批量把作业中处于 `from` 状态的任务改为 `to`，返回实际受影响的任务数
    async fn update_job_task_statuses(
        &self,
        job_id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        activity: &str,
        now: DateTime<Utc>,
    ) -> ManagerResult<u64>;

    /// 仍处于 active 状态且最后触碰时间早于 `untouched_since` 的任务
    async fn fetch_timed_out_tasks(
        &self,
        untouched_since: DateTime<Utc>,
    ) -> ManagerResult<Vec<Task>>;

    /// 为Worker挑选最合适的可运行任务
    ///
    /// 条件：任务可调度、任务类型受Worker支持、作业标签匹配、
    /// Worker不在该作业该任务类型的黑名单中、该Worker没有失败过此任务、
    /// 所有依赖均已成功完成、作业处于可运行状态且未请求删除。
    /// 排序：作业优先级降序、任务优先级降序、最早排队者优先。
    async fn find_runnable_task(&self, worker: &Worker) -> ManagerResult<Option<Task>>;
}

/// 任务失败记录与作业黑名单仓储接口
#[async_trait]
pub trait BlocklistRepository: Send + Sync {
    /// 记录Worker执行任务失败，重复记录不产生新条目；返回是否新插入
    async fn add_task_failure(
        &self,
        task: &Task,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> ManagerResult<bool>;

    /// 在该作业中执行过该类型任务且失败过的不同Worker数量
    async fn count_workers_failed_task_type(
        &self,
        job_id: Uuid,
        task_type: &str,
    ) -> ManagerResult<i64>;

    /// 该Worker在该作业中失败的该类型任务数量
    async fn count_task_failures_of_worker(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        task_type: &str,
    ) -> ManagerResult<i64>;

    /// 执行该任务失败过的Worker
    async fn fetch_task_failure_list(&self, task_id: Uuid) -> ManagerResult<Vec<Uuid>>;

    async fn clear_failure_list_of_task(&self, task_id: Uuid) -> ManagerResult<()>;

    async fn clear_failure_list_of_job(&self, job_id: Uuid) -> ManagerResult<()>;

    /// 加入作业黑名单，已存在时不做任何事
    async fn add_worker_to_job_blocklist(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        task_type: &str,
        now: DateTime<Utc>,
    ) -> ManagerResult<()>;

    async fn fetch_job_blocklist(&self, job_id: Uuid) -> ManagerResult<Vec<JobBlock>>;

    /// 返回实际删除的条目数
    async fn remove_from_job_blocklist(&self, entries: &[JobBlock]) -> ManagerResult<u64>;

    async fn clear_job_blocklist(&self, job_id: Uuid) -> ManagerResult<()>;

    /// 还能执行该作业中该类型任务的Worker：支持该任务类型、标签匹配、不在黑名单中
    async fn workers_left_to_run(&self, job: &Job, task_type: &str) -> ManagerResult<Vec<Uuid>>;
}

/// Worker仓储接口
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn create_worker(&self, worker: &Worker) -> ManagerResult<()>;

    /// 查询Worker，包括它的标签
    async fn get_worker(&self, worker_id: Uuid) -> ManagerResult<Option<Worker>>;

    async fn list_workers(&self) -> ManagerResult<Vec<Worker>>;

    /// 保存除标签外的全部字段
    async fn save_worker(&self, worker: &Worker) -> ManagerResult<()>;

    /// 只保存状态、请求状态与lazy标记
    async fn save_worker_status(&self, worker: &Worker) -> ManagerResult<()>;

    async fn worker_seen(&self, worker_id: Uuid, now: DateTime<Utc>) -> ManagerResult<()>;

    /// 最后在线时间早于 `last_seen_before` 且不处于 error/offline 状态的Worker
    async fn fetch_timed_out_workers(
        &self,
        last_seen_before: DateTime<Utc>,
    ) -> ManagerResult<Vec<Worker>>;

    async fn delete_worker(&self, worker_id: Uuid) -> ManagerResult<()>;
}

/// Worker标签仓储接口
#[async_trait]
pub trait WorkerTagRepository: Send + Sync {
    async fn create_worker_tag(&self, tag: &WorkerTag) -> ManagerResult<()>;

    async fn get_worker_tag(&self, tag_id: Uuid) -> ManagerResult<Option<WorkerTag>>;

    async fn list_worker_tags(&self) -> ManagerResult<Vec<WorkerTag>>;

    async fn save_worker_tag(&self, tag: &WorkerTag) -> ManagerResult<()>;

    async fn delete_worker_tag(&self, tag_id: Uuid) -> ManagerResult<()>;

    /// 用给定的标签集合替换Worker现有的标签
    async fn set_worker_tags(&self, worker_id: Uuid, tag_ids: &[Uuid]) -> ManagerResult<()>;
}

/// 睡眠计划仓储接口
#[async_trait]
pub trait SleepScheduleRepository: Send + Sync {
    async fn fetch_sleep_schedule(&self, worker_id: Uuid)
        -> ManagerResult<Option<SleepSchedule>>;

    /// 新建或整体替换Worker的睡眠计划
    async fn save_sleep_schedule(&self, schedule: &SleepSchedule) -> ManagerResult<()>;

    async fn save_sleep_schedule_next_check(&self, schedule: &SleepSchedule)
        -> ManagerResult<()>;

    /// 处于激活状态且 `next_check` 为空或不晚于 `now` 的睡眠计划
    async fn fetch_sleep_schedules_to_check(
        &self,
        now: DateTime<Utc>,
    ) -> ManagerResult<Vec<SleepSchedule>>;
}

/// 全部仓储的集合，构造一次后注入到各个服务中
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub blocklist: Arc<dyn BlocklistRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub worker_tags: Arc<dyn WorkerTagRepository>,
    pub sleep_schedules: Arc<dyn SleepScheduleRepository>,
}

impl Repositories {
    /// 用同一个实现了全部仓储接口的存储构造集合
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: JobRepository
            + TaskRepository
            + BlocklistRepository
            + WorkerRepository
            + WorkerTagRepository
            + SleepScheduleRepository
            + 'static,
    {
        Self {
            jobs: store.clone(),
            tasks: store.clone(),
            blocklist: store.clone(),
            workers: store.clone(),
            worker_tags: store.clone(),
            sleep_schedules: store,
        }
    }

    pub async fn fetch_job(&self, job_id: Uuid) -> ManagerResult<Job> {
        self.jobs
            .get_job(job_id)
            .await?
            .ok_or(crate::ManagerError::JobNotFound { id: job_id })
    }

    pub async fn fetch_task(&self, task_id: Uuid) -> ManagerResult<Task> {
        self.tasks
            .get_task(task_id)
            .await?
            .ok_or(crate::ManagerError::TaskNotFound { id: task_id })
    }

    pub async fn fetch_worker(&self, worker_id: Uuid) -> ManagerResult<Worker> {
        self.workers
            .get_worker(worker_id)
            .await?
            .ok_or(crate::ManagerError::WorkerNotFound { id: worker_id })
    }

    pub async fn fetch_worker_tag(&self, tag_id: Uuid) -> ManagerResult<WorkerTag> {
        self.worker_tags
            .get_worker_tag(tag_id)
            .await?
            .ok_or(crate::ManagerError::WorkerTagNotFound { id: tag_id })
    }
}
