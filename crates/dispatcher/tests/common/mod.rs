#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use renderfarm_core::{Job, Repositories, Task, Worker};
use renderfarm_dispatcher::{
    JobDeleter, JobDeleterConfig, JobService, SleepScheduler, SleepSchedulerConfig,
    StateMachineConfig, TaskScheduler, TaskStateMachine, TimeoutChecker, TimeoutCheckerConfig,
    WorkerService,
};
use renderfarm_domain::JobCompiler;
use renderfarm_infrastructure::MetricsCollector;
use renderfarm_testing_utils::{InMemoryStore, MockClock, RecordingBroadcaster, RecordingLogSink};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 5, 10, 0, 0).unwrap()
}

/// 用内存存储装配全部服务
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub repos: Repositories,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub log_sink: Arc<RecordingLogSink>,
    pub clock: Arc<MockClock>,
    pub metrics: Arc<MetricsCollector>,
    pub state_machine: Arc<TaskStateMachine>,
    pub scheduler: Arc<TaskScheduler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(StateMachineConfig::default())
    }

    pub fn with_config(config: StateMachineConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let repos = Repositories::from_store(store.clone());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let log_sink = Arc::new(RecordingLogSink::new());
        let clock = Arc::new(MockClock::new(start_time()));
        let metrics = Arc::new(MetricsCollector::new().unwrap());

        let state_machine = Arc::new(TaskStateMachine::new(
            repos.clone(),
            log_sink.clone(),
            broadcaster.clone(),
            clock.clone(),
            metrics.clone(),
            config,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            repos.clone(),
            state_machine.clone(),
            clock.clone(),
            metrics.clone(),
        ));

        Self {
            store,
            repos,
            broadcaster,
            log_sink,
            clock,
            metrics,
            state_machine,
            scheduler,
        }
    }

    pub fn add_job(&self, job: &Job, tasks: Vec<Task>) {
        self.store.insert_job(job.clone(), tasks);
    }

    pub fn add_worker(&self, worker: &Worker) {
        self.store.insert_worker(worker.clone());
    }

    pub fn worker_service(&self) -> WorkerService {
        WorkerService::new(
            self.repos.clone(),
            self.state_machine.clone(),
            self.scheduler.clone(),
            self.log_sink.clone(),
            self.broadcaster.clone(),
            self.clock.clone(),
        )
    }

    pub fn job_deleter(&self, config: JobDeleterConfig) -> Arc<JobDeleter> {
        Arc::new(JobDeleter::new(
            self.repos.clone(),
            self.broadcaster.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            config,
        ))
    }

    pub fn job_service(&self) -> JobService {
        JobService::new(
            self.repos.clone(),
            Arc::new(JobCompiler::with_builtin_job_types(self.clock.clone())),
            self.state_machine.clone(),
            self.job_deleter(JobDeleterConfig::default()),
            self.broadcaster.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    pub fn timeout_checker(&self, config: TimeoutCheckerConfig) -> TimeoutChecker {
        TimeoutChecker::new(
            self.repos.clone(),
            self.state_machine.clone(),
            self.log_sink.clone(),
            self.broadcaster.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            config,
        )
    }

    pub fn sleep_scheduler(&self) -> SleepScheduler {
        SleepScheduler::new(
            self.repos.clone(),
            self.broadcaster.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            SleepSchedulerConfig::default(),
        )
    }
}
