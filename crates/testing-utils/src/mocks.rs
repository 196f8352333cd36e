//! In-memory implementations of the repository and collaborator traits
//!
//! `InMemoryStore` keeps every table behind one mutex, so multi-table queries such as
//! runnable-task selection see a consistent snapshot the way a single SQL query would.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use renderfarm_core::{
    BlocklistRepository, ChangeBroadcaster, ChangeEvent, Clock, Job, JobBlock, JobRepository,
    ManagerError, ManagerResult, SleepSchedule, SleepScheduleRepository, Task, TaskFailure,
    TaskLogSink, TaskRepository, TaskStatus, Worker, WorkerRepository, WorkerStatus, WorkerTag,
    WorkerTagRepository,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreState {
    // Vecs keep insertion order, which stands in for the row id ordering of the SQL store.
    jobs: Vec<Job>,
    tasks: Vec<Task>,
    workers: Vec<Worker>,
    worker_tags: Vec<WorkerTag>,
    tag_membership: HashMap<Uuid, Vec<Uuid>>,
    task_failures: Vec<TaskFailure>,
    job_blocks: Vec<JobBlock>,
    sleep_schedules: HashMap<Uuid, SleepSchedule>,
    // Errors queued per repository method name, returned by the next calls of that method.
    injected_failures: HashMap<&'static str, VecDeque<ManagerError>>,
}

impl StoreState {
    fn job(&self, job_id: Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    fn job_mut(&mut self, job_id: Uuid) -> ManagerResult<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(ManagerError::JobNotFound { id: job_id })
    }

    fn task(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    fn task_mut(&mut self, task_id: Uuid) -> ManagerResult<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(ManagerError::TaskNotFound { id: task_id })
    }

    fn worker_mut(&mut self, worker_id: Uuid) -> ManagerResult<&mut Worker> {
        self.workers
            .iter_mut()
            .find(|w| w.id == worker_id)
            .ok_or(ManagerError::WorkerNotFound { id: worker_id })
    }

    fn worker_with_tags(&self, worker: &Worker) -> Worker {
        let mut worker = worker.clone();
        let tag_ids = self
            .tag_membership
            .get(&worker.id)
            .cloned()
            .unwrap_or_default();
        worker.tags = self
            .worker_tags
            .iter()
            .filter(|tag| tag_ids.contains(&tag.id))
            .cloned()
            .collect();
        worker
    }

    fn is_blocklisted(&self, job_id: Uuid, worker_id: Uuid, task_type: &str) -> bool {
        self.job_blocks.iter().any(|block| {
            block.job_id == job_id && block.worker_id == worker_id && block.task_type == task_type
        })
    }

    fn failures_of_job_type<'a>(
        &'a self,
        job_id: Uuid,
        task_type: &'a str,
    ) -> impl Iterator<Item = &'a TaskFailure> + 'a {
        self.task_failures.iter().filter(move |failure| {
            self.task(failure.task_id)
                .map(|task| task.job_id == job_id && task.task_type == task_type)
                .unwrap_or(false)
        })
    }

    fn is_runnable_for(&self, task: &Task, worker: &Worker) -> bool {
        if !task.status.is_schedulable() || !worker.supports_task_type(&task.task_type) {
            return false;
        }
        let Some(job) = self.job(task.job_id) else {
            return false;
        };
        if !job.status.is_runnable() || job.is_deletion_requested() {
            return false;
        }
        if !worker.may_run_job_with_tag(job.worker_tag_id) {
            return false;
        }
        if self.is_blocklisted(job.id, worker.id, &task.task_type) {
            return false;
        }
        if self
            .task_failures
            .iter()
            .any(|f| f.task_id == task.id && f.worker_id == worker.id)
        {
            return false;
        }
        task.dependencies.iter().all(|dep_id| {
            self.task(*dep_id)
                .map(|dep| dep.status.is_successful_terminal())
                .unwrap_or(false)
        })
    }
}

/// In-memory store implementing every repository trait
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job and its tasks directly, bypassing the job compiler
    pub fn insert_job(&self, job: Job, tasks: Vec<Task>) {
        let mut state = self.state.lock().unwrap();
        state.jobs.push(job);
        state.tasks.extend(tasks);
    }

    pub fn insert_worker(&self, worker: Worker) {
        let mut state = self.state.lock().unwrap();
        let tag_ids = worker.tags.iter().map(|tag| tag.id).collect::<Vec<_>>();
        for tag in &worker.tags {
            if !state.worker_tags.iter().any(|t| t.id == tag.id) {
                state.worker_tags.push(tag.clone());
            }
        }
        state.tag_membership.insert(worker.id, tag_ids);
        state.workers.push(worker);
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.state.lock().unwrap().job(job_id).cloned()
    }

    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.state.lock().unwrap().task(task_id).cloned()
    }

    pub fn worker(&self, worker_id: Uuid) -> Option<Worker> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .iter()
            .find(|w| w.id == worker_id)
            .map(|w| state.worker_with_tags(w))
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn task_failures(&self) -> Vec<TaskFailure> {
        self.state.lock().unwrap().task_failures.clone()
    }

    pub fn job_blocks(&self) -> Vec<JobBlock> {
        self.state.lock().unwrap().job_blocks.clone()
    }

    /// Make the next call of the named repository method fail with `error`
    ///
    /// Queuing several errors for the same method fails that many consecutive calls.
    /// Calls of other methods are unaffected.
    pub fn fail_next(&self, method: &'static str, error: ManagerError) {
        self.state
            .lock()
            .unwrap()
            .injected_failures
            .entry(method)
            .or_default()
            .push_back(error);
    }

    /// Make the next call of the named repository method fail with `StoreBusy`
    pub fn fail_next_busy(&self, method: &'static str) {
        self.fail_next(
            method,
            ManagerError::StoreBusy(format!("database is locked ({method})")),
        );
    }

    fn injected_failure(&self, method: &'static str) -> ManagerResult<()> {
        let mut state = self.state.lock().unwrap();
        match state
            .injected_failures
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Overwrite a task's status without going through the state machine
    pub fn force_task_status(&self, task_id: Uuid, status: TaskStatus) {
        let mut state = self.state.lock().unwrap();
        if let Ok(task) = state.task_mut(task_id) {
            task.status = status;
        }
    }
}

#[async_trait]
impl JobRepository for InMemoryStore {
    async fn store_job(&self, job: &Job, tasks: &[Task]) -> ManagerResult<()> {
        self.injected_failure("store_job")?;
        let mut state = self.state.lock().unwrap();
        state.jobs.retain(|j| j.id != job.id);
        state.tasks.retain(|t| t.job_id != job.id);
        state.jobs.push(job.clone());
        state.tasks.extend(tasks.iter().cloned());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> ManagerResult<Option<Job>> {
        self.injected_failure("get_job")?;
        Ok(self.state.lock().unwrap().job(job_id).cloned())
    }

    async fn list_jobs(&self) -> ManagerResult<Vec<Job>> {
        self.injected_failure("list_jobs")?;
        Ok(self.state.lock().unwrap().jobs.clone())
    }

    async fn save_job_status(&self, job: &Job) -> ManagerResult<()> {
        self.injected_failure("save_job_status")?;
        let mut state = self.state.lock().unwrap();
        let stored = state.job_mut(job.id)?;
        stored.status = job.status;
        stored.activity = job.activity.clone();
        stored.updated_at = job.updated_at;
        Ok(())
    }

    async fn save_job_priority(&self, job: &Job) -> ManagerResult<()> {
        self.injected_failure("save_job_priority")?;
        let mut state = self.state.lock().unwrap();
        let stored = state.job_mut(job.id)?;
        stored.priority = job.priority;
        stored.updated_at = job.updated_at;
        Ok(())
    }

    async fn request_job_deletion(&self, job: &Job) -> ManagerResult<()> {
        self.injected_failure("request_job_deletion")?;
        let mut state = self.state.lock().unwrap();
        let stored = state.job_mut(job.id)?;
        stored.delete_requested_at = job.delete_requested_at;
        stored.updated_at = job.updated_at;
        Ok(())
    }

    async fn fetch_jobs_deletion_requested(&self) -> ManagerResult<Vec<Uuid>> {
        self.injected_failure("fetch_jobs_deletion_requested")?;
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<&Job> = state
            .jobs
            .iter()
            .filter(|j| j.delete_requested_at.is_some())
            .collect();
        jobs.sort_by_key(|j| j.delete_requested_at);
        Ok(jobs.into_iter().map(|j| j.id).collect())
    }

    async fn fetch_jobs_last_updated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> ManagerResult<Vec<Uuid>> {
        self.injected_failure("fetch_jobs_last_updated_before")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.updated_at < cutoff)
            .map(|j| j.id)
            .collect())
    }

    async fn delete_job(&self, job_id: Uuid) -> ManagerResult<()> {
        self.injected_failure("delete_job")?;
        let mut state = self.state.lock().unwrap();
        if state.job(job_id).is_none() {
            return Err(ManagerError::JobNotFound { id: job_id });
        }
        let task_ids: HashSet<Uuid> = state
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id)
            .map(|t| t.id)
            .collect();
        state.jobs.retain(|j| j.id != job_id);
        state.tasks.retain(|t| t.job_id != job_id);
        state.task_failures.retain(|f| !task_ids.contains(&f.task_id));
        state.job_blocks.retain(|b| b.job_id != job_id);
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn get_task(&self, task_id: Uuid) -> ManagerResult<Option<Task>> {
        self.injected_failure("get_task")?;
        Ok(self.state.lock().unwrap().task(task_id).cloned())
    }

    async fn save_task(&self, task: &Task) -> ManagerResult<()> {
        self.injected_failure("save_task")?;
        let mut state = self.state.lock().unwrap();
        let stored = state.task_mut(task.id)?;
        stored.status = task.status;
        stored.worker_id = task.worker_id;
        stored.activity = task.activity.clone();
        stored.last_touched_at = task.last_touched_at;
        stored.priority = task.priority;
        stored.updated_at = task.updated_at;
        Ok(())
    }

    async fn save_task_activity(&self, task: &Task) -> ManagerResult<()> {
        self.injected_failure("save_task_activity")?;
        let mut state = self.state.lock().unwrap();
        let stored = state.task_mut(task.id)?;
        stored.activity = task.activity.clone();
        Ok(())
    }

    async fn touch_task(&self, task_id: Uuid, now: DateTime<Utc>) -> ManagerResult<()> {
        self.injected_failure("touch_task")?;
        let mut state = self.state.lock().unwrap();
        state.task_mut(task_id)?.last_touched_at = Some(now);
        Ok(())
    }

    async fn fetch_tasks_of_job(&self, job_id: Uuid) -> ManagerResult<Vec<Task>> {
        self.injected_failure("fetch_tasks_of_job")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn fetch_tasks_of_job_in_status(
        &self,
        job_id: Uuid,
        statuses: &[TaskStatus],
    ) -> ManagerResult<Vec<Task>> {
        self.injected_failure("fetch_tasks_of_job_in_status")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id && statuses.contains(&t.status))
            .cloned()
            .collect())
    }

    async fn fetch_tasks_of_worker_in_status(
        &self,
        worker_id: Uuid,
        status: TaskStatus,
    ) -> ManagerResult<Vec<Task>> {
        self.injected_failure("fetch_tasks_of_worker_in_status")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.worker_id == Some(worker_id) && t.status == status)
            .cloned()
            .collect())
    }

    async fn count_tasks_of_job_by_status(
        &self,
        job_id: Uuid,
    ) -> ManagerResult<HashMap<TaskStatus, i64>> {
        self.injected_failure("count_tasks_of_job_by_status")?;
        let state = self.state.lock().unwrap();
        let mut counts = HashMap::new();
        for task in state.tasks.iter().filter(|t| t.job_id == job_id) {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn update_job_task_statuses(
        &self,
        job_id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        activity: &str,
        now: DateTime<Utc>,
    ) -> ManagerResult<u64> {
        self.injected_failure("update_job_task_statuses")?;
        let mut state = self.state.lock().unwrap();
        let mut updated = 0;
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.job_id == job_id && from.contains(&t.status))
        {
            task.status = to;
            task.activity = activity.to_string();
            task.updated_at = now;
            updated += 1;
        }
        Ok(updated)
    }

    async fn fetch_timed_out_tasks(
        &self,
        untouched_since: DateTime<Utc>,
    ) -> ManagerResult<Vec<Task>> {
        self.injected_failure("fetch_timed_out_tasks")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Active
                    && t.last_touched_at
                        .map(|touched| touched < untouched_since)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_runnable_task(&self, worker: &Worker) -> ManagerResult<Option<Task>> {
        self.injected_failure("find_runnable_task")?;
        let state = self.state.lock().unwrap();
        let job_priority = |task: &Task| state.job(task.job_id).map(|j| j.priority).unwrap_or(0);

        // Ties beyond created_at fall back to insertion order through the stable sort.
        let mut candidates: Vec<&Task> = state
            .tasks
            .iter()
            .filter(|task| state.is_runnable_for(task, worker))
            .collect();
        candidates.sort_by(|a, b| {
            job_priority(b)
                .cmp(&job_priority(a))
                .then(b.priority.cmp(&a.priority))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(candidates.first().map(|task| (*task).clone()))
    }
}

#[async_trait]
impl BlocklistRepository for InMemoryStore {
    async fn add_task_failure(
        &self,
        task: &Task,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> ManagerResult<bool> {
        self.injected_failure("add_task_failure")?;
        let mut state = self.state.lock().unwrap();
        if state
            .task_failures
            .iter()
            .any(|f| f.task_id == task.id && f.worker_id == worker_id)
        {
            return Ok(false);
        }
        state.task_failures.push(TaskFailure {
            task_id: task.id,
            worker_id,
            created_at: now,
        });
        Ok(true)
    }

    async fn count_workers_failed_task_type(
        &self,
        job_id: Uuid,
        task_type: &str,
    ) -> ManagerResult<i64> {
        self.injected_failure("count_workers_failed_task_type")?;
        let state = self.state.lock().unwrap();
        let workers: HashSet<Uuid> = state
            .failures_of_job_type(job_id, task_type)
            .map(|f| f.worker_id)
            .collect();
        Ok(workers.len() as i64)
    }

    async fn count_task_failures_of_worker(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        task_type: &str,
    ) -> ManagerResult<i64> {
        self.injected_failure("count_task_failures_of_worker")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .failures_of_job_type(job_id, task_type)
            .filter(|f| f.worker_id == worker_id)
            .count() as i64)
    }

    async fn fetch_task_failure_list(&self, task_id: Uuid) -> ManagerResult<Vec<Uuid>> {
        self.injected_failure("fetch_task_failure_list")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .task_failures
            .iter()
            .filter(|f| f.task_id == task_id)
            .map(|f| f.worker_id)
            .collect())
    }

    async fn clear_failure_list_of_task(&self, task_id: Uuid) -> ManagerResult<()> {
        self.injected_failure("clear_failure_list_of_task")?;
        let mut state = self.state.lock().unwrap();
        state.task_failures.retain(|f| f.task_id != task_id);
        Ok(())
    }

    async fn clear_failure_list_of_job(&self, job_id: Uuid) -> ManagerResult<()> {
        self.injected_failure("clear_failure_list_of_job")?;
        let mut state = self.state.lock().unwrap();
        let task_ids: HashSet<Uuid> = state
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id)
            .map(|t| t.id)
            .collect();
        state.task_failures.retain(|f| !task_ids.contains(&f.task_id));
        Ok(())
    }

    async fn add_worker_to_job_blocklist(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        task_type: &str,
        _now: DateTime<Utc>,
    ) -> ManagerResult<()> {
        self.injected_failure("add_worker_to_job_blocklist")?;
        let mut state = self.state.lock().unwrap();
        if !state.is_blocklisted(job_id, worker_id, task_type) {
            state.job_blocks.push(JobBlock {
                job_id,
                worker_id,
                task_type: task_type.to_string(),
            });
        }
        Ok(())
    }

    async fn fetch_job_blocklist(&self, job_id: Uuid) -> ManagerResult<Vec<JobBlock>> {
        self.injected_failure("fetch_job_blocklist")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .job_blocks
            .iter()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn remove_from_job_blocklist(&self, entries: &[JobBlock]) -> ManagerResult<u64> {
        self.injected_failure("remove_from_job_blocklist")?;
        let mut state = self.state.lock().unwrap();
        let before = state.job_blocks.len();
        state.job_blocks.retain(|b| !entries.contains(b));
        Ok((before - state.job_blocks.len()) as u64)
    }

    async fn clear_job_blocklist(&self, job_id: Uuid) -> ManagerResult<()> {
        self.injected_failure("clear_job_blocklist")?;
        let mut state = self.state.lock().unwrap();
        state.job_blocks.retain(|b| b.job_id != job_id);
        Ok(())
    }

    async fn workers_left_to_run(&self, job: &Job, task_type: &str) -> ManagerResult<Vec<Uuid>> {
        self.injected_failure("workers_left_to_run")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .workers
            .iter()
            .map(|w| state.worker_with_tags(w))
            .filter(|w| {
                w.supports_task_type(task_type)
                    && w.may_run_job_with_tag(job.worker_tag_id)
                    && !state.is_blocklisted(job.id, w.id, task_type)
            })
            .map(|w| w.id)
            .collect())
    }
}

#[async_trait]
impl WorkerRepository for InMemoryStore {
    async fn create_worker(&self, worker: &Worker) -> ManagerResult<()> {
        self.injected_failure("create_worker")?;
        self.insert_worker(worker.clone());
        Ok(())
    }

    async fn get_worker(&self, worker_id: Uuid) -> ManagerResult<Option<Worker>> {
        self.injected_failure("get_worker")?;
        Ok(self.worker(worker_id))
    }

    async fn list_workers(&self) -> ManagerResult<Vec<Worker>> {
        self.injected_failure("list_workers")?;
        let state = self.state.lock().unwrap();
        let mut workers: Vec<Worker> = state
            .workers
            .iter()
            .map(|w| state.worker_with_tags(w))
            .collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn save_worker(&self, worker: &Worker) -> ManagerResult<()> {
        self.injected_failure("save_worker")?;
        let mut state = self.state.lock().unwrap();
        let stored = state.worker_mut(worker.id)?;
        let tags = std::mem::take(&mut stored.tags);
        *stored = worker.clone();
        stored.tags = tags;
        Ok(())
    }

    async fn save_worker_status(&self, worker: &Worker) -> ManagerResult<()> {
        self.injected_failure("save_worker_status")?;
        let mut state = self.state.lock().unwrap();
        let stored = state.worker_mut(worker.id)?;
        stored.status = worker.status;
        stored.status_requested = worker.status_requested;
        stored.lazy_status_request = worker.lazy_status_request;
        stored.updated_at = worker.updated_at;
        Ok(())
    }

    async fn worker_seen(&self, worker_id: Uuid, now: DateTime<Utc>) -> ManagerResult<()> {
        self.injected_failure("worker_seen")?;
        let mut state = self.state.lock().unwrap();
        state.worker_mut(worker_id)?.last_seen_at = Some(now);
        Ok(())
    }

    async fn fetch_timed_out_workers(
        &self,
        last_seen_before: DateTime<Utc>,
    ) -> ManagerResult<Vec<Worker>> {
        self.injected_failure("fetch_timed_out_workers")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .workers
            .iter()
            .filter(|w| {
                !matches!(w.status, WorkerStatus::Error | WorkerStatus::Offline)
                    && w.last_seen_at
                        .map(|seen| seen < last_seen_before)
                        .unwrap_or(false)
            })
            .map(|w| state.worker_with_tags(w))
            .collect())
    }

    async fn delete_worker(&self, worker_id: Uuid) -> ManagerResult<()> {
        self.injected_failure("delete_worker")?;
        let mut state = self.state.lock().unwrap();
        state.worker_mut(worker_id)?;
        state.workers.retain(|w| w.id != worker_id);
        state.tag_membership.remove(&worker_id);
        state.sleep_schedules.remove(&worker_id);
        state.task_failures.retain(|f| f.worker_id != worker_id);
        state.job_blocks.retain(|b| b.worker_id != worker_id);
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.worker_id == Some(worker_id))
        {
            task.worker_id = None;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerTagRepository for InMemoryStore {
    async fn create_worker_tag(&self, tag: &WorkerTag) -> ManagerResult<()> {
        self.injected_failure("create_worker_tag")?;
        self.state.lock().unwrap().worker_tags.push(tag.clone());
        Ok(())
    }

    async fn get_worker_tag(&self, tag_id: Uuid) -> ManagerResult<Option<WorkerTag>> {
        self.injected_failure("get_worker_tag")?;
        let state = self.state.lock().unwrap();
        Ok(state.worker_tags.iter().find(|t| t.id == tag_id).cloned())
    }

    async fn list_worker_tags(&self) -> ManagerResult<Vec<WorkerTag>> {
        self.injected_failure("list_worker_tags")?;
        let mut tags = self.state.lock().unwrap().worker_tags.clone();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn save_worker_tag(&self, tag: &WorkerTag) -> ManagerResult<()> {
        self.injected_failure("save_worker_tag")?;
        let mut state = self.state.lock().unwrap();
        let stored = state
            .worker_tags
            .iter_mut()
            .find(|t| t.id == tag.id)
            .ok_or(ManagerError::WorkerTagNotFound { id: tag.id })?;
        *stored = tag.clone();
        Ok(())
    }

    async fn delete_worker_tag(&self, tag_id: Uuid) -> ManagerResult<()> {
        self.injected_failure("delete_worker_tag")?;
        let mut state = self.state.lock().unwrap();
        if !state.worker_tags.iter().any(|t| t.id == tag_id) {
            return Err(ManagerError::WorkerTagNotFound { id: tag_id });
        }
        state.worker_tags.retain(|t| t.id != tag_id);
        for tag_ids in state.tag_membership.values_mut() {
            tag_ids.retain(|id| *id != tag_id);
        }
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.worker_tag_id == Some(tag_id))
        {
            job.worker_tag_id = None;
        }
        Ok(())
    }

    async fn set_worker_tags(&self, worker_id: Uuid, tag_ids: &[Uuid]) -> ManagerResult<()> {
        self.injected_failure("set_worker_tags")?;
        let mut state = self.state.lock().unwrap();
        state.worker_mut(worker_id)?;
        state.tag_membership.insert(worker_id, tag_ids.to_vec());
        Ok(())
    }
}

#[async_trait]
impl SleepScheduleRepository for InMemoryStore {
    async fn fetch_sleep_schedule(
        &self,
        worker_id: Uuid,
    ) -> ManagerResult<Option<SleepSchedule>> {
        self.injected_failure("fetch_sleep_schedule")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .sleep_schedules
            .get(&worker_id)
            .cloned())
    }

    async fn save_sleep_schedule(&self, schedule: &SleepSchedule) -> ManagerResult<()> {
        self.injected_failure("save_sleep_schedule")?;
        self.state
            .lock()
            .unwrap()
            .sleep_schedules
            .insert(schedule.worker_id, schedule.clone());
        Ok(())
    }

    async fn save_sleep_schedule_next_check(
        &self,
        schedule: &SleepSchedule,
    ) -> ManagerResult<()> {
        self.injected_failure("save_sleep_schedule_next_check")?;
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state.sleep_schedules.get_mut(&schedule.worker_id) {
            stored.next_check = schedule.next_check;
        }
        Ok(())
    }

    async fn fetch_sleep_schedules_to_check(
        &self,
        now: DateTime<Utc>,
    ) -> ManagerResult<Vec<SleepSchedule>> {
        self.injected_failure("fetch_sleep_schedules_to_check")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .sleep_schedules
            .values()
            .filter(|s| s.is_active && s.next_check.map(|next| next <= now).unwrap_or(true))
            .cloned()
            .collect())
    }
}

/// Broadcaster that records every event it is given
#[derive(Debug, Clone, Default)]
pub struct RecordingBroadcaster {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl ChangeBroadcaster for RecordingBroadcaster {
    fn broadcast(&self, event: ChangeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Task-log sink that keeps the lines in memory, keyed by task
#[derive(Debug, Clone, Default)]
pub struct RecordingLogSink {
    lines: Arc<Mutex<HashMap<Uuid, Vec<String>>>>,
}

impl RecordingLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines_for(&self, task_id: Uuid) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskLogSink for RecordingLogSink {
    async fn write_timestamped(&self, _job_id: Uuid, task_id: Uuid, text: &str) -> ManagerResult<()> {
        self.lines
            .lock()
            .unwrap()
            .entry(task_id)
            .or_default()
            .push(text.to_string());
        Ok(())
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
