//! Worker相关的操作：注册、上线/下线、状态请求、领取任务、任务进度更新、标签管理

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use renderfarm_core::{
    ChangeBroadcaster, ChangeEvent, Clock, ManagerError, ManagerResult, Repositories, Task,
    TaskLogSink, TaskStatus, Worker, WorkerStatus, WorkerTag, WorkerTagUpdate, WorkerUpdate,
};
use renderfarm_infrastructure::StructuredLogger;

use crate::task_scheduler::TaskScheduler;
use crate::task_state_machine::TaskStateMachineService;

/// Worker请求任务的结果
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    /// Worker有未处理的状态请求，必须先切换状态
    MustChangeState(WorkerStatus),
    /// Worker当前不是awake状态
    NotAwake(WorkerStatus),
    /// 没有可运行的任务
    NoTask,
    Assigned(Task),
}

/// Worker上报的任务进度
#[derive(Debug, Clone, Default)]
pub struct TaskUpdateRequest {
    pub activity: Option<String>,
    pub status: Option<TaskStatus>,
    pub log: Option<String>,
}

pub struct WorkerService {
    repos: Repositories,
    state_machine: Arc<dyn TaskStateMachineService>,
    scheduler: Arc<TaskScheduler>,
    log_sink: Arc<dyn TaskLogSink>,
    broadcaster: Arc<dyn ChangeBroadcaster>,
    clock: Arc<dyn Clock>,
}

impl WorkerService {
    pub fn new(
        repos: Repositories,
        state_machine: Arc<dyn TaskStateMachineService>,
        scheduler: Arc<TaskScheduler>,
        log_sink: Arc<dyn TaskLogSink>,
        broadcaster: Arc<dyn ChangeBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repos,
            state_machine,
            scheduler,
            log_sink,
            broadcaster,
            clock,
        }
    }

    /// 注册新的Worker，初始状态为offline
    pub async fn register_worker(&self, mut worker: Worker) -> ManagerResult<Worker> {
        let now = self.clock.now();
        if worker.id.is_nil() {
            worker.id = Uuid::new_v4();
        }
        worker.status = WorkerStatus::Offline;
        worker.status_change_clear();
        worker.created_at = now;
        worker.updated_at = now;
        worker.last_seen_at = Some(now);

        self.repos.workers.create_worker(&worker).await?;
        info!("注册新Worker: {}", worker.identifier());
        self.broadcaster
            .broadcast(ChangeEvent::Worker(WorkerUpdate::new(&worker)));
        Ok(worker)
    }

    pub async fn fetch_worker(&self, worker_id: Uuid) -> ManagerResult<Worker> {
        self.repos.fetch_worker(worker_id).await
    }

    pub async fn list_workers(&self) -> ManagerResult<Vec<Worker>> {
        self.repos.workers.list_workers().await
    }

    /// Worker上线，返回它应该进入的状态
    pub async fn sign_on(&self, worker_id: Uuid) -> ManagerResult<WorkerStatus> {
        let mut worker = self.repos.fetch_worker(worker_id).await?;
        let previous_status = worker.status;

        worker.status = WorkerStatus::Starting;
        worker.last_seen_at = Some(self.clock.now());
        worker.updated_at = self.clock.now();
        self.repos.workers.save_worker(&worker).await?;

        info!("Worker {} 上线", worker.identifier());
        self.broadcast_worker(&worker, previous_status);

        Ok(worker.status_requested.unwrap_or(WorkerStatus::Awake))
    }

    /// Worker下线，它手上的任务会被放回队列
    pub async fn sign_off(&self, worker_id: Uuid) -> ManagerResult<()> {
        let mut worker = self.repos.fetch_worker(worker_id).await?;
        let previous_status = worker.status;

        // 下次上线时恢复到之前的状态
        if !worker.has_status_request()
            && matches!(previous_status, WorkerStatus::Awake | WorkerStatus::Asleep)
        {
            worker.status_change_request(previous_status, false);
        }
        worker.status = WorkerStatus::Offline;
        worker.updated_at = self.clock.now();
        self.repos.workers.save_worker(&worker).await?;
        info!("Worker {} 下线", worker.identifier());

        let requeue_result = self
            .state_machine
            .requeue_active_tasks_of_worker(&worker, "worker signed off")
            .await;
        self.broadcast_worker(&worker, previous_status);
        requeue_result
    }

    /// Worker报告自己已经切换到新状态
    pub async fn state_changed(
        &self,
        worker_id: Uuid,
        new_status: WorkerStatus,
    ) -> ManagerResult<()> {
        let mut worker = self.repos.fetch_worker(worker_id).await?;
        let previous_status = worker.status;

        if worker.status_requested == Some(new_status) {
            worker.status_change_clear();
        } else if let Some(requested) = worker.status_requested {
            debug!(
                "Worker {} 切换到 {}，但请求的状态是 {}",
                worker.identifier(),
                new_status,
                requested
            );
        }

        worker.status = new_status;
        worker.last_seen_at = Some(self.clock.now());
        worker.updated_at = self.clock.now();
        self.repos.workers.save_worker_status(&worker).await?;
        self.repos.workers.worker_seen(worker.id, self.clock.now()).await?;

        StructuredLogger::log_worker_status_change(
            worker.id,
            previous_status.as_str(),
            new_status.as_str(),
        );
        self.broadcast_worker(&worker, previous_status);
        Ok(())
    }

    /// 记录Worker最近一次出现的时间
    pub async fn worker_seen(&self, worker_id: Uuid) -> ManagerResult<()> {
        self.repos.workers.worker_seen(worker_id, self.clock.now()).await
    }

    /// 请求Worker切换状态；请求当前状态等于撤销已有请求
    pub async fn request_status_change(
        &self,
        worker_id: Uuid,
        status: WorkerStatus,
        is_lazy: bool,
    ) -> ManagerResult<Worker> {
        let mut worker = self.repos.fetch_worker(worker_id).await?;

        if worker.status == status {
            worker.status_change_clear();
        } else {
            worker.status_change_request(status, is_lazy);
        }
        worker.updated_at = self.clock.now();
        self.repos.workers.save_worker_status(&worker).await?;

        info!(
            "Worker {} 状态请求: {:?} (lazy={})",
            worker.identifier(),
            worker.status_requested.map(|s| s.as_str()),
            worker.lazy_status_request
        );
        self.broadcaster
            .broadcast(ChangeEvent::Worker(WorkerUpdate::new(&worker)));
        Ok(worker)
    }

    /// 为Worker领取任务
    ///
    /// 有未处理的状态请求或者Worker不是awake时不会尝试挑选任务。
    pub async fn schedule_task_for_worker(
        &self,
        worker_id: Uuid,
    ) -> ManagerResult<ScheduleOutcome> {
        let worker = self.repos.fetch_worker(worker_id).await?;
        self.repos.workers.worker_seen(worker.id, self.clock.now()).await?;

        if let Some(requested) = worker.status_requested {
            debug!(
                "Worker {} 需要先切换到 {}",
                worker.identifier(),
                requested
            );
            return Ok(ScheduleOutcome::MustChangeState(requested));
        }
        if worker.status != WorkerStatus::Awake {
            debug!(
                "Worker {} 状态为 {}，不分配任务",
                worker.identifier(),
                worker.status
            );
            return Ok(ScheduleOutcome::NotAwake(worker.status));
        }

        match self.scheduler.schedule_task(&worker).await? {
            Some(task) => Ok(ScheduleOutcome::Assigned(task)),
            None => Ok(ScheduleOutcome::NoTask),
        }
    }

    /// Worker上报任务进度
    pub async fn task_update(
        &self,
        worker_id: Uuid,
        task_id: Uuid,
        update: TaskUpdateRequest,
    ) -> ManagerResult<Task> {
        let worker = self.repos.fetch_worker(worker_id).await?;
        let mut task = self.repos.fetch_task(task_id).await?;
        if !task.is_assigned_to(worker.id) {
            warn!(
                task_id = %task.id,
                worker = %worker.identifier(),
                "Worker上报了不属于它的任务"
            );
            return Err(ManagerError::TaskNotAssigned {
                task_id,
                worker_id,
            });
        }

        let now = self.clock.now();
        self.repos.tasks.touch_task(task.id, now).await?;
        self.repos.workers.worker_seen(worker.id, now).await?;
        task.last_touched_at = Some(now);

        if let Some(activity) = update.activity {
            task.activity = activity;
            self.repos.tasks.save_task_activity(&task).await?;
        }
        if let Some(log) = update.log.as_deref() {
            self.log_sink
                .write_timestamped(task.job_id, task.id, log)
                .await?;
        }

        if let Some(status) = update.status {
            // Worker报告的失败先算作软失败，由状态机决定是否升级
            let status = match status {
                TaskStatus::Failed => TaskStatus::SoftFailed,
                other => other,
            };
            self.state_machine.task_status_change(&mut task, status).await?;
        }
        Ok(task)
    }

    /// 检查Worker是否还可以继续执行该任务
    pub async fn may_worker_run(&self, worker_id: Uuid, task_id: Uuid) -> ManagerResult<bool> {
        let worker = self.repos.fetch_worker(worker_id).await?;
        let task = self.repos.fetch_task(task_id).await?;
        if !task.is_assigned_to(worker.id) || task.status != TaskStatus::Active {
            return Ok(false);
        }
        if worker.status_requested.is_some() && !worker.lazy_status_request {
            return Ok(false);
        }
        Ok(true)
    }

    /// 删除Worker，它手上的任务先放回队列
    pub async fn delete_worker(&self, worker_id: Uuid) -> ManagerResult<()> {
        let worker = self.repos.fetch_worker(worker_id).await?;
        self.state_machine
            .requeue_active_tasks_of_worker(&worker, "worker is being deleted")
            .await?;
        self.repos.workers.delete_worker(worker.id).await?;

        info!("Worker {} 已删除", worker.identifier());
        self.broadcaster.broadcast(ChangeEvent::Worker(
            WorkerUpdate::new(&worker).mark_deleted(),
        ));
        Ok(())
    }

    pub async fn set_worker_tags(&self, worker_id: Uuid, tag_ids: &[Uuid]) -> ManagerResult<Worker> {
        self.repos.fetch_worker(worker_id).await?;
        for tag_id in tag_ids {
            self.repos.fetch_worker_tag(*tag_id).await?;
        }
        self.repos.worker_tags.set_worker_tags(worker_id, tag_ids).await?;

        let worker = self.repos.fetch_worker(worker_id).await?;
        self.broadcaster
            .broadcast(ChangeEvent::Worker(WorkerUpdate::new(&worker)));
        Ok(worker)
    }

    pub async fn create_worker_tag(&self, mut tag: WorkerTag) -> ManagerResult<WorkerTag> {
        if tag.id.is_nil() {
            tag.id = Uuid::new_v4();
        }
        self.repos.worker_tags.create_worker_tag(&tag).await?;
        info!("创建Worker标签 {} ({})", tag.name, tag.id);
        self.broadcaster.broadcast(ChangeEvent::WorkerTag(WorkerTagUpdate {
            tag: tag.clone(),
            was_deleted: false,
        }));
        Ok(tag)
    }

    pub async fn fetch_worker_tag(&self, tag_id: Uuid) -> ManagerResult<WorkerTag> {
        self.repos.fetch_worker_tag(tag_id).await
    }

    pub async fn list_worker_tags(&self) -> ManagerResult<Vec<WorkerTag>> {
        self.repos.worker_tags.list_worker_tags().await
    }

    pub async fn update_worker_tag(&self, tag: WorkerTag) -> ManagerResult<WorkerTag> {
        self.repos.fetch_worker_tag(tag.id).await?;
        self.repos.worker_tags.save_worker_tag(&tag).await?;
        self.broadcaster.broadcast(ChangeEvent::WorkerTag(WorkerTagUpdate {
            tag: tag.clone(),
            was_deleted: false,
        }));
        Ok(tag)
    }

    pub async fn delete_worker_tag(&self, tag_id: Uuid) -> ManagerResult<()> {
        let tag = self.repos.fetch_worker_tag(tag_id).await?;
        self.repos.worker_tags.delete_worker_tag(tag_id).await?;
        info!("删除Worker标签 {} ({})", tag.name, tag.id);
        self.broadcaster.broadcast(ChangeEvent::WorkerTag(WorkerTagUpdate {
            tag,
            was_deleted: true,
        }));
        Ok(())
    }

    fn broadcast_worker(&self, worker: &Worker, previous_status: WorkerStatus) {
        self.broadcaster.broadcast(ChangeEvent::Worker(
            WorkerUpdate::new(worker).with_previous_status(previous_status),
        ));
    }
}
