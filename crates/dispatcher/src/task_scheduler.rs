use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use renderfarm_core::{Clock, ManagerResult, Repositories, Task, TaskStatus, Worker};
use renderfarm_infrastructure::{MetricsCollector, StructuredLogger};

use crate::task_state_machine::TaskStateMachineService;

/// 任务调度器
///
/// 为Worker挑选下一个可运行的任务。挑选、分配、标记为active这一整段在同一把锁内完成，
/// 因此并发请求的Worker不会拿到同一个任务。
pub struct TaskScheduler {
    repos: Repositories,
    state_machine: Arc<dyn TaskStateMachineService>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    lock: Mutex<()>,
}

impl TaskScheduler {
    pub fn new(
        repos: Repositories,
        state_machine: Arc<dyn TaskStateMachineService>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            repos,
            state_machine,
            clock,
            metrics,
            lock: Mutex::new(()),
        }
    }

    /// 为Worker挑选并分配一个任务，没有可运行的任务时返回None
    pub async fn schedule_task(&self, worker: &Worker) -> ManagerResult<Option<Task>> {
        let started = Instant::now();
        let _guard = self.lock.lock().await;

        let result = self.schedule_task_locked(worker).await;
        let assigned = matches!(result, Ok(Some(_)));
        self.metrics
            .record_scheduling(assigned, started.elapsed().as_secs_f64());
        result
    }

    async fn schedule_task_locked(&self, worker: &Worker) -> ManagerResult<Option<Task>> {
        // 已经分配给该Worker的active任务直接交还
        let active = self
            .repos
            .tasks
            .fetch_tasks_of_worker_in_status(worker.id, TaskStatus::Active)
            .await?;
        if let Some(task) = active.into_iter().next() {
            debug!(task_id = %task.id, worker = %worker.identifier(), "Worker已有active任务，重新交还");
            self.repos.tasks.touch_task(task.id, self.clock.now()).await?;
            return Ok(Some(task));
        }

        let Some(mut task) = self.repos.tasks.find_runnable_task(worker).await? else {
            debug!(worker = %worker.identifier(), "没有适合该Worker的任务");
            return Ok(None);
        };

        let previous_worker = task.worker_id;
        task.worker_id = Some(worker.id);
        if let Err(err) = self
            .state_machine
            .task_status_change(&mut task, TaskStatus::Active)
            .await
        {
            error!(
                task_id = %task.id,
                worker = %worker.identifier(),
                error = %err,
                "无法将任务标记为active"
            );
            task.worker_id = previous_worker;
            return Err(err);
        }

        self.repos.tasks.touch_task(task.id, self.clock.now()).await?;
        task.last_touched_at = Some(self.clock.now());

        StructuredLogger::log_task_assigned(task.id, &task.name, task.job_id, &worker.identifier());
        info!("任务 {} 已分配给Worker {}", task.name, worker.identifier());
        Ok(Some(task))
    }
}
