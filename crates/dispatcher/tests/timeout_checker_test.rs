mod common;

use std::time::Duration as StdDuration;

use chrono::Duration;
use common::{start_time, Harness};
use renderfarm_core::{ChangeEvent, JobStatus, TaskStatus, WorkerStatus};
use renderfarm_dispatcher::TimeoutCheckerConfig;
use renderfarm_testing_utils::{JobBuilder, TaskBuilder, WorkerBuilder};
use uuid::Uuid;

fn config() -> TimeoutCheckerConfig {
    TimeoutCheckerConfig {
        task_timeout: StdDuration::from_secs(600),
        worker_timeout: StdDuration::from_secs(60),
        initial_delay: StdDuration::from_millis(0),
        check_interval: StdDuration::from_secs(1),
    }
}

#[tokio::test]
async fn test_stale_task_is_failed_with_worker_name() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().with_name("render-01").build();
    h.add_worker(&worker);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let stale = TaskBuilder::new(job.id)
        .active_on(worker.id, start_time() - Duration::minutes(30))
        .build();
    let fresh = TaskBuilder::new(job.id)
        .active_on(worker.id, start_time() - Duration::minutes(1))
        .build();
    let mut tasks = vec![stale.clone(), fresh.clone()];
    tasks.extend((0..10).map(|_| TaskBuilder::new(job.id).build()));
    h.add_job(&job, tasks);

    h.timeout_checker(config()).check_timeouts().await;

    let task = h.store.task(stale.id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.activity.contains("render-01"));
    assert!(task.activity.contains("untouched since 2024-06-05T09:30:00Z"));
    assert!(h
        .log_sink
        .lines_for(stale.id)
        .iter()
        .any(|line| line.contains("Task timed out")));

    assert_eq!(h.store.task(fresh.id).unwrap().status, TaskStatus::Active);
    // 失败比例还不到阈值，作业保持active
    assert_eq!(h.store.job(job.id).unwrap().status, JobStatus::Active);
}

#[tokio::test]
async fn test_stale_task_of_unknown_worker() {
    let h = Harness::new();
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let stale = TaskBuilder::new(job.id)
        .active_on(Uuid::new_v4(), start_time() - Duration::hours(1))
        .build();
    h.add_job(&job, vec![stale.clone()]);

    h.timeout_checker(config()).check_timeouts().await;

    let task = h.store.task(stale.id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.activity.contains("-unknown-"));
    assert_eq!(h.store.job(job.id).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_silent_worker_goes_to_error_and_tasks_are_requeued() {
    let h = Harness::new();
    let worker = WorkerBuilder::new()
        .with_last_seen(start_time() - Duration::minutes(5))
        .with_status_request(WorkerStatus::Asleep, true)
        .build();
    let offline = WorkerBuilder::new()
        .with_name("offline")
        .with_status(WorkerStatus::Offline)
        .with_last_seen(start_time() - Duration::hours(5))
        .build();
    h.add_worker(&worker);
    h.add_worker(&offline);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let task = TaskBuilder::new(job.id)
        .active_on(worker.id, start_time() - Duration::minutes(1))
        .build();
    h.add_job(&job, vec![task.clone()]);

    h.timeout_checker(config()).check_timeouts().await;

    let stored = h.store.worker(worker.id).unwrap();
    assert_eq!(stored.status, WorkerStatus::Error);
    assert_eq!(stored.status_requested, None);
    assert_eq!(h.store.worker(offline.id).unwrap().status, WorkerStatus::Offline);

    let task = h.store.task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.activity.contains("worker timed out"));

    assert!(h.broadcaster.events().iter().any(|e| matches!(e,
        ChangeEvent::Worker(update) if update.id == worker.id
            && update.status == WorkerStatus::Error
            && update.previous_status == Some(WorkerStatus::Awake))));
}

/// 一个超时任务和一个失联Worker，二者互不相关
fn stale_task_and_silent_worker(h: &Harness) -> (Uuid, Uuid) {
    let busy = WorkerBuilder::new().with_name("render-01").build();
    let silent = WorkerBuilder::new()
        .with_name("silent")
        .with_last_seen(start_time() - Duration::minutes(5))
        .build();
    h.add_worker(&busy);
    h.add_worker(&silent);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let stale = TaskBuilder::new(job.id)
        .active_on(busy.id, start_time() - Duration::minutes(30))
        .build();
    h.add_job(&job, vec![stale.clone()]);
    (stale.id, silent.id)
}

#[tokio::test]
async fn test_task_sweep_failure_does_not_stop_worker_sweep() {
    let h = Harness::new();
    let (stale_id, silent_id) = stale_task_and_silent_worker(&h);

    h.store.fail_next_busy("fetch_timed_out_tasks");
    h.timeout_checker(config()).check_timeouts().await;

    assert_eq!(h.store.task(stale_id).unwrap().status, TaskStatus::Active);
    assert_eq!(h.store.worker(silent_id).unwrap().status, WorkerStatus::Error);
}

#[tokio::test]
async fn test_worker_sweep_failure_does_not_undo_task_sweep() {
    let h = Harness::new();
    let (stale_id, silent_id) = stale_task_and_silent_worker(&h);

    h.store.fail_next_busy("fetch_timed_out_workers");
    h.timeout_checker(config()).check_timeouts().await;

    assert_eq!(h.store.task(stale_id).unwrap().status, TaskStatus::Failed);
    assert_eq!(h.store.worker(silent_id).unwrap().status, WorkerStatus::Awake);

    // 下一轮检测正常进行
    h.timeout_checker(config()).check_timeouts().await;
    assert_eq!(h.store.worker(silent_id).unwrap().status, WorkerStatus::Error);
}

#[tokio::test]
async fn test_run_exits_on_shutdown() {
    let h = Harness::new();
    let checker = h.timeout_checker(config());
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    let handle = tokio::spawn(async move { checker.run(rx).await });
    tx.send(()).unwrap();

    tokio::time::timeout(StdDuration::from_secs(2), handle)
        .await
        .expect("timeout checker did not stop")
        .unwrap();
}
