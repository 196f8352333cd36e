//! 在真实的SQLite存储上跑完整的作业流程

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use renderfarm_core::{JobStatus, Repositories, TaskStatus, WorkerStatus};
use renderfarm_dispatcher::{
    JobDeleter, JobDeleterConfig, JobService, ScheduleOutcome, StateMachineConfig, TaskScheduler,
    TaskStateMachine, TaskUpdateRequest, WorkerService,
};
use renderfarm_domain::{JobCompiler, SubmittedJob};
use renderfarm_infrastructure::{DatabaseManager, MetricsCollector};
use renderfarm_testing_utils::{MockClock, RecordingBroadcaster, RecordingLogSink, WorkerBuilder};
use serde_json::json;
use uuid::Uuid;

struct Services {
    db: DatabaseManager,
    repos: Repositories,
    workers: WorkerService,
    jobs: JobService,
    deleter: Arc<JobDeleter>,
}

async fn services() -> Services {
    let db = DatabaseManager::in_memory().await.unwrap();
    let repos = db.repositories();
    let clock = Arc::new(MockClock::new(
        Utc.with_ymd_and_hms(2024, 6, 5, 10, 0, 0).unwrap(),
    ));
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let log_sink = Arc::new(RecordingLogSink::new());
    let metrics = Arc::new(MetricsCollector::new().unwrap());

    let state_machine = Arc::new(TaskStateMachine::new(
        repos.clone(),
        log_sink.clone(),
        broadcaster.clone(),
        clock.clone(),
        metrics.clone(),
        StateMachineConfig::default(),
    ));
    let scheduler = Arc::new(TaskScheduler::new(
        repos.clone(),
        state_machine.clone(),
        clock.clone(),
        metrics.clone(),
    ));
    let deleter = Arc::new(JobDeleter::new(
        repos.clone(),
        broadcaster.clone(),
        clock.clone(),
        metrics.clone(),
        JobDeleterConfig::default(),
    ));
    let workers = WorkerService::new(
        repos.clone(),
        state_machine.clone(),
        scheduler,
        log_sink,
        broadcaster.clone(),
        clock.clone(),
    );
    let jobs = JobService::new(
        repos.clone(),
        Arc::new(JobCompiler::with_builtin_job_types(clock.clone())),
        state_machine,
        deleter.clone(),
        broadcaster,
        clock,
        metrics,
    );

    Services {
        db,
        repos,
        workers,
        jobs,
        deleter,
    }
}

fn render_submission() -> SubmittedJob {
    let settings = json!({
        "filepath": "/projects/shot/shot.flamenco.blend",
        "frames": "1-30",
        "chunk_size": 10,
        "render_output_path": "/render/shot/######",
        "format": "PNG",
        "fps": 24.0,
        "output_file_extension": ".png",
    });
    SubmittedJob {
        name: "Shot 020".to_string(),
        job_type: "simple-blender-render".to_string(),
        priority: 50,
        settings: settings.as_object().unwrap().clone(),
        ..Default::default()
    }
}

async fn awake_worker(s: &Services, name: &str) -> Uuid {
    let worker = s
        .workers
        .register_worker(WorkerBuilder::new().with_name(name).with_id(Uuid::nil()).build())
        .await
        .unwrap();
    let status = s.workers.sign_on(worker.id).await.unwrap();
    assert_eq!(status, WorkerStatus::Awake);
    s.workers.state_changed(worker.id, status).await.unwrap();
    worker.id
}

async fn report(s: &Services, worker_id: Uuid, task_id: Uuid, status: TaskStatus) {
    s.workers
        .task_update(
            worker_id,
            task_id,
            TaskUpdateRequest {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_job_runs_to_completion_on_sqlite() {
    let s = services().await;
    let worker = awake_worker(&s, "render-01").await;
    let job = s.jobs.submit_job(&render_submission()).await.unwrap();

    let mut executed = Vec::new();
    loop {
        match s.workers.schedule_task_for_worker(worker).await.unwrap() {
            ScheduleOutcome::Assigned(task) => {
                assert_eq!(task.status, TaskStatus::Active);
                executed.push(task.name.clone());
                report(&s, worker, task.id, TaskStatus::Completed).await;
            }
            ScheduleOutcome::NoTask => break,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(
        executed,
        vec!["render-1-10", "render-11-20", "render-21-30", "create-video"]
    );
    assert_eq!(s.jobs.fetch_job(job.id).await.unwrap().status, JobStatus::Completed);

    let job = s.jobs.request_job_deletion(job.id).await.unwrap();
    assert!(job.is_deletion_requested());
    s.deleter.delete_job(job.id).await.unwrap();
    assert!(s.repos.jobs.get_job(job.id).await.unwrap().is_none());
    s.db.close().await;
}

#[tokio::test]
async fn test_failed_task_moves_to_another_worker_on_sqlite() {
    let s = services().await;
    let first = awake_worker(&s, "render-01").await;
    let second = awake_worker(&s, "render-02").await;
    let job = s.jobs.submit_job(&render_submission()).await.unwrap();

    let ScheduleOutcome::Assigned(task) = s.workers.schedule_task_for_worker(first).await.unwrap()
    else {
        panic!("first worker should get a task");
    };
    report(&s, first, task.id, TaskStatus::Failed).await;

    let stored = s.jobs.fetch_task(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::SoftFailed);
    assert_eq!(
        s.jobs.fetch_task_failure_list(task.id).await.unwrap(),
        vec![first]
    );

    // the failing worker moves on, the other one picks the soft-failed task up
    let ScheduleOutcome::Assigned(next) = s.workers.schedule_task_for_worker(first).await.unwrap()
    else {
        panic!("first worker should get another task");
    };
    assert_ne!(next.id, task.id);

    let ScheduleOutcome::Assigned(retry) = s.workers.schedule_task_for_worker(second).await.unwrap()
    else {
        panic!("second worker should get the soft-failed task");
    };
    assert_eq!(retry.id, task.id);
    assert_eq!(s.jobs.fetch_job(job.id).await.unwrap().status, JobStatus::Active);
}
