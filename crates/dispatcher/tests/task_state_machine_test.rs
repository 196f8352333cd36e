mod common;

use common::{start_time, Harness};
use renderfarm_core::{ChangeEvent, JobStatus, ManagerError, TaskStatus};
use renderfarm_dispatcher::{StateMachineConfig, TaskStateMachineService};
use renderfarm_testing_utils::{JobBuilder, TaskBuilder, WorkerBuilder};

#[tokio::test]
async fn test_completing_all_tasks_completes_job() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let task1 = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    let task2 = TaskBuilder::new(job.id)
        .with_status(TaskStatus::Completed)
        .build();
    h.add_job(&job, vec![task1.clone(), task2]);

    let mut task = h.store.task(task1.id).unwrap();
    h.state_machine
        .task_status_change(&mut task, TaskStatus::Completed)
        .await
        .unwrap();

    assert_eq!(h.store.task(task1.id).unwrap().status, TaskStatus::Completed);
    assert_eq!(h.store.job(job.id).unwrap().status, JobStatus::Completed);

    let events = h.broadcaster.events();
    assert!(events.iter().any(|e| matches!(e,
        ChangeEvent::Task(update) if update.id == task1.id
            && update.previous_status == Some(TaskStatus::Active)
            && update.status == TaskStatus::Completed)));
    assert!(events.iter().any(|e| matches!(e,
        ChangeEvent::Job(update) if update.status == JobStatus::Completed)));
    assert!(!h.log_sink.lines_for(task1.id).is_empty());
}

#[tokio::test]
async fn test_illegal_transition_is_rejected() {
    let h = Harness::new();
    let job = JobBuilder::new().build();
    let task = TaskBuilder::new(job.id)
        .with_status(TaskStatus::Completed)
        .build();
    h.add_job(&job, vec![task.clone()]);

    let mut task = h.store.task(task.id).unwrap();
    let err = h
        .state_machine
        .task_status_change(&mut task, TaskStatus::Active)
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::InvalidTransition { .. }));
    assert_eq!(h.store.task(task.id).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_active_requires_worker() {
    let h = Harness::new();
    let job = JobBuilder::new().build();
    let task = TaskBuilder::new(job.id).build();
    h.add_job(&job, vec![task.clone()]);

    let mut task = h.store.task(task.id).unwrap();
    let result = h
        .state_machine
        .task_status_change(&mut task, TaskStatus::Active)
        .await;

    assert!(result.is_err());
    assert_eq!(h.store.task(task.id).unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_soft_failure_records_failure_once() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    let other = WorkerBuilder::new().with_name("other").build();
    h.add_worker(&worker);
    h.add_worker(&other);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let tasks: Vec<_> = (0..20)
        .map(|i| TaskBuilder::new(job.id).with_name(&format!("render-{i}")).build())
        .collect();
    let failing = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    let mut all = tasks.clone();
    all.push(failing.clone());
    h.add_job(&job, all);

    let mut task = h.store.task(failing.id).unwrap();
    h.state_machine
        .task_status_change(&mut task, TaskStatus::SoftFailed)
        .await
        .unwrap();
    assert_eq!(h.store.task(failing.id).unwrap().status, TaskStatus::SoftFailed);

    // 同一个Worker再次失败同一个任务
    let mut task = h.store.task(failing.id).unwrap();
    task.status = TaskStatus::Active;
    h.store.force_task_status(failing.id, TaskStatus::Active);
    h.state_machine
        .task_status_change(&mut task, TaskStatus::SoftFailed)
        .await
        .unwrap();

    let failures = h.store.task_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].worker_id, worker.id);
}

#[tokio::test]
async fn test_worker_gets_blocklisted_after_threshold() {
    let h = Harness::with_config(StateMachineConfig {
        blocklist_threshold: 2,
        task_fail_after_softfail_count: 5,
    });
    let worker = WorkerBuilder::new().build();
    let other = WorkerBuilder::new().with_name("other").build();
    h.add_worker(&worker);
    h.add_worker(&other);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let mut tasks: Vec<_> = (0..20)
        .map(|i| TaskBuilder::new(job.id).with_name(&format!("render-{i}")).build())
        .collect();
    let first = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    let second = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    tasks.push(first.clone());
    tasks.push(second.clone());
    h.add_job(&job, tasks);

    for task_id in [first.id, second.id] {
        let mut task = h.store.task(task_id).unwrap();
        h.state_machine
            .task_status_change(&mut task, TaskStatus::SoftFailed)
            .await
            .unwrap();
    }

    let blocks = h.store.job_blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].worker_id, worker.id);
    assert_eq!(blocks[0].task_type, "blender");
    // 还有一个Worker可用，所以任务只是软失败
    assert_eq!(h.store.task(second.id).unwrap().status, TaskStatus::SoftFailed);
}

#[tokio::test]
async fn test_task_hard_fails_when_no_workers_left() {
    let h = Harness::with_config(StateMachineConfig {
        blocklist_threshold: 1,
        task_fail_after_softfail_count: 5,
    });
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let failing = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    h.add_job(&job, vec![failing.clone()]);

    let mut task = h.store.task(failing.id).unwrap();
    h.state_machine
        .task_status_change(&mut task, TaskStatus::SoftFailed)
        .await
        .unwrap();

    assert_eq!(h.store.task(failing.id).unwrap().status, TaskStatus::Failed);
    assert_eq!(h.store.job(job.id).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_task_hard_fails_after_softfail_count() {
    let h = Harness::with_config(StateMachineConfig {
        blocklist_threshold: 10,
        task_fail_after_softfail_count: 2,
    });
    let workers: Vec<_> = (0..3)
        .map(|i| WorkerBuilder::new().with_name(&format!("w{i}")).build())
        .collect();
    for worker in &workers {
        h.add_worker(worker);
    }
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let task = TaskBuilder::new(job.id).active_on(workers[0].id, start_time()).build();
    h.add_job(&job, vec![task.clone()]);

    let mut current = h.store.task(task.id).unwrap();
    h.state_machine
        .task_status_change(&mut current, TaskStatus::SoftFailed)
        .await
        .unwrap();
    assert_eq!(h.store.task(task.id).unwrap().status, TaskStatus::SoftFailed);

    let mut current = h.store.task(task.id).unwrap();
    current.status = TaskStatus::Active;
    current.worker_id = Some(workers[1].id);
    h.store.force_task_status(task.id, TaskStatus::Active);
    h.state_machine
        .task_status_change(&mut current, TaskStatus::SoftFailed)
        .await
        .unwrap();

    assert_eq!(h.store.task(task.id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_cancel_requested_job_cancels_tasks() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let active = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    let queued = TaskBuilder::new(job.id).build();
    let done = TaskBuilder::new(job.id).with_status(TaskStatus::Completed).build();
    h.add_job(&job, vec![active.clone(), queued.clone(), done.clone()]);

    let mut job = h.store.job(job.id).unwrap();
    h.state_machine
        .job_status_change(&mut job, JobStatus::CancelRequested, "user canceled")
        .await
        .unwrap();

    assert_eq!(h.store.job(job.id).unwrap().status, JobStatus::Canceled);
    assert_eq!(h.store.task(active.id).unwrap().status, TaskStatus::Canceled);
    assert_eq!(h.store.task(queued.id).unwrap().status, TaskStatus::Canceled);
    assert_eq!(h.store.task(done.id).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_requeueing_failed_job_requeues_failed_tasks_and_clears_blocklist() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().with_status(JobStatus::Failed).build();
    let failed = TaskBuilder::new(job.id).with_status(TaskStatus::Failed).build();
    let canceled = TaskBuilder::new(job.id).with_status(TaskStatus::Canceled).build();
    let done = TaskBuilder::new(job.id).with_status(TaskStatus::Completed).build();
    h.add_job(&job, vec![failed.clone(), canceled.clone(), done.clone()]);

    use renderfarm_core::BlocklistRepository;
    h.store.add_task_failure(&failed, worker.id, start_time()).await.unwrap();
    h.store
        .add_worker_to_job_blocklist(job.id, worker.id, "blender", start_time())
        .await
        .unwrap();

    let mut job = h.store.job(job.id).unwrap();
    h.state_machine
        .job_status_change(&mut job, JobStatus::Requeueing, "try again")
        .await
        .unwrap();

    assert_eq!(h.store.job(job.id).unwrap().status, JobStatus::Queued);
    assert_eq!(h.store.task(failed.id).unwrap().status, TaskStatus::Queued);
    assert_eq!(h.store.task(canceled.id).unwrap().status, TaskStatus::Queued);
    assert_eq!(h.store.task(done.id).unwrap().status, TaskStatus::Completed);
    assert!(h.store.task_failures().is_empty());
    assert!(h.store.job_blocks().is_empty());
}

#[tokio::test]
async fn test_requeueing_completed_job_requeues_everything() {
    let h = Harness::new();
    let job = JobBuilder::new().with_status(JobStatus::Completed).build();
    let tasks: Vec<_> = (0..3)
        .map(|_| TaskBuilder::new(job.id).with_status(TaskStatus::Completed).build())
        .collect();
    h.add_job(&job, tasks.clone());

    let mut job = h.store.job(job.id).unwrap();
    h.state_machine
        .job_status_change(&mut job, JobStatus::Requeueing, "render again")
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    for task in tasks {
        assert_eq!(h.store.task(task.id).unwrap().status, TaskStatus::Queued);
    }
}

#[tokio::test]
async fn test_pause_and_resume_job() {
    let h = Harness::new();
    let job = JobBuilder::new().with_status(JobStatus::Queued).build();
    let task = TaskBuilder::new(job.id).build();
    h.add_job(&job, vec![task.clone()]);

    let mut job = h.store.job(job.id).unwrap();
    h.state_machine
        .job_status_change(&mut job, JobStatus::Paused, "pause")
        .await
        .unwrap();
    assert_eq!(h.store.task(task.id).unwrap().status, TaskStatus::Paused);

    h.state_machine
        .job_status_change(&mut job, JobStatus::Queued, "resume")
        .await
        .unwrap();
    assert_eq!(h.store.task(task.id).unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_requeue_active_tasks_of_worker() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let a = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    let b = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    h.add_job(&job, vec![a.clone(), b.clone()]);

    h.state_machine
        .requeue_active_tasks_of_worker(&worker, "worker signed off")
        .await
        .unwrap();

    for id in [a.id, b.id] {
        let task = h.store.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.activity.contains("worker signed off"));
        assert!(h
            .log_sink
            .lines_for(id)
            .iter()
            .any(|line| line.contains("worker signed off")));
    }
}

#[tokio::test]
async fn test_bulk_cancel_broadcasts_and_logs_every_task() {
    let h = Harness::new();
    let job = JobBuilder::new().with_status(JobStatus::Queued).build();
    let tasks: Vec<_> = (0..3)
        .map(|i| TaskBuilder::new(job.id).with_name(&format!("render-{i}")).build())
        .collect();
    h.add_job(&job, tasks.clone());

    let mut job = h.store.job(job.id).unwrap();
    h.state_machine
        .job_status_change(&mut job, JobStatus::CancelRequested, "user canceled")
        .await
        .unwrap();
    assert_eq!(h.store.job(job.id).unwrap().status, JobStatus::Canceled);

    let events = h.broadcaster.events();
    let expected_line = format!(
        "task changed status {} -> {}",
        TaskStatus::Queued,
        TaskStatus::Canceled
    );
    for task in &tasks {
        let stored = h.store.task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Canceled);
        assert_eq!(stored.updated_at, start_time());

        assert!(events.iter().any(|e| matches!(e,
            ChangeEvent::Task(update) if update.id == task.id
                && update.previous_status == Some(TaskStatus::Queued)
                && update.status == TaskStatus::Canceled
                && update.activity.contains("cancel-requested"))));
        let lines = h.log_sink.lines_for(task.id);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(&expected_line));
    }
    assert!(events.iter().any(|e| matches!(e,
        ChangeEvent::Job(update) if update.id == job.id && update.refresh_tasks)));
}

#[tokio::test]
async fn test_pause_without_matching_tasks_sends_no_task_events() {
    let h = Harness::new();
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let done = TaskBuilder::new(job.id).with_status(TaskStatus::Completed).build();
    h.add_job(&job, vec![done.clone()]);

    let mut job = h.store.job(job.id).unwrap();
    h.state_machine
        .job_status_change(&mut job, JobStatus::Paused, "pause")
        .await
        .unwrap();

    let events = h.broadcaster.events();
    assert!(!events.iter().any(|e| matches!(e, ChangeEvent::Task(_))));
    assert!(!events.iter().any(|e| matches!(e,
        ChangeEvent::Job(update) if update.refresh_tasks)));
    assert!(h.log_sink.lines_for(done.id).is_empty());
}

#[tokio::test]
async fn test_requeue_of_worker_continues_past_failing_task() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let a = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    let b = TaskBuilder::new(job.id).active_on(worker.id, start_time()).build();
    h.add_job(&job, vec![a.clone(), b.clone()]);

    h.store.fail_next_busy("save_task_activity");
    let err = h
        .state_machine
        .requeue_active_tasks_of_worker(&worker, "worker signed off")
        .await
        .unwrap_err();

    assert!(err.is_store_busy());
    assert_eq!(h.store.task(a.id).unwrap().status, TaskStatus::Active);
    assert_eq!(h.store.task(b.id).unwrap().status, TaskStatus::Queued);
    assert!(h
        .log_sink
        .lines_for(b.id)
        .iter()
        .any(|line| line.contains("worker signed off")));
}
