mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{start_time, Harness};
use renderfarm_core::{BlocklistRepository, JobStatus, TaskStatus, WorkerTag};
use renderfarm_testing_utils::{JobBuilder, TaskBuilder, WorkerBuilder};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_scheduling_hands_out_task_once() {
    let h = Harness::new();
    let job = JobBuilder::new().build();
    let task = TaskBuilder::new(job.id).build();
    h.add_job(&job, vec![task.clone()]);

    let workers: Vec<_> = (0..8)
        .map(|i| WorkerBuilder::new().with_name(&format!("worker-{i}")).build())
        .collect();
    for worker in &workers {
        h.add_worker(worker);
    }

    let mut handles = Vec::new();
    for worker in workers {
        let scheduler = Arc::clone(&h.scheduler);
        handles.push(tokio::spawn(async move {
            scheduler.schedule_task(&worker).await.unwrap()
        }));
    }

    let mut assigned = 0;
    for handle in handles {
        if let Some(scheduled) = handle.await.unwrap() {
            assert_eq!(scheduled.id, task.id);
            assigned += 1;
        }
    }
    assert_eq!(assigned, 1);

    let stored = h.store.task(task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Active);
    assert!(stored.worker_id.is_some());
    assert!(stored.last_touched_at.is_some());
}

#[tokio::test]
async fn test_dependencies_gate_scheduling() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().build();
    let render = TaskBuilder::new(job.id).with_name("render").build();
    let video = TaskBuilder::new(job.id)
        .with_name("video")
        .with_task_type("ffmpeg")
        .with_priority(100)
        .with_dependencies(vec![render.id])
        .build();
    h.add_job(&job, vec![render.clone(), video.clone()]);

    let first = h.scheduler.schedule_task(&worker).await.unwrap().unwrap();
    assert_eq!(first.id, render.id);

    // 依赖还没完成，其他Worker拿不到视频任务
    let other = WorkerBuilder::new().with_name("other").build();
    h.add_worker(&other);
    assert!(h.scheduler.schedule_task(&other).await.unwrap().is_none());

    h.store.force_task_status(render.id, TaskStatus::Completed);
    let next = h.scheduler.schedule_task(&other).await.unwrap().unwrap();
    assert_eq!(next.id, video.id);
}

#[tokio::test]
async fn test_priority_ordering() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);

    let low_job = JobBuilder::new().with_priority(10).build();
    let high_job = JobBuilder::new().with_priority(90).build();
    let low_task = TaskBuilder::new(low_job.id).with_priority(100).build();
    let older = TaskBuilder::new(high_job.id)
        .with_created_at(start_time() - Duration::minutes(5))
        .build();
    let newer = TaskBuilder::new(high_job.id).with_created_at(start_time()).build();
    let urgent = TaskBuilder::new(high_job.id)
        .with_priority(80)
        .with_created_at(start_time())
        .build();
    h.add_job(&low_job, vec![low_task.clone()]);
    h.add_job(&high_job, vec![newer.clone(), older.clone(), urgent.clone()]);

    let order = [urgent.id, older.id, newer.id, low_task.id];
    for expected in order {
        let task = h.scheduler.schedule_task(&worker).await.unwrap().unwrap();
        assert_eq!(task.id, expected);
        h.store.force_task_status(task.id, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn test_worker_task_types_and_tags() {
    let h = Harness::new();
    let tag = WorkerTag::new("gpu");
    let plain = WorkerBuilder::new()
        .with_name("plain")
        .with_task_types(&["blender"])
        .build();
    let tagged = WorkerBuilder::new()
        .with_name("tagged")
        .with_task_types(&["blender"])
        .with_tag(tag.clone())
        .build();
    let ffmpeg_only = WorkerBuilder::new()
        .with_name("ffmpeg")
        .with_task_types(&["ffmpeg"])
        .build();
    h.add_worker(&plain);
    h.add_worker(&tagged);
    h.add_worker(&ffmpeg_only);

    let job = JobBuilder::new().with_worker_tag(tag.id).build();
    let task = TaskBuilder::new(job.id).build();
    h.add_job(&job, vec![task.clone()]);

    assert!(h.scheduler.schedule_task(&ffmpeg_only).await.unwrap().is_none());
    assert!(h.scheduler.schedule_task(&plain).await.unwrap().is_none());
    let scheduled = h.scheduler.schedule_task(&tagged).await.unwrap().unwrap();
    assert_eq!(scheduled.id, task.id);
}

#[tokio::test]
async fn test_blocklisted_worker_is_skipped() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().build();
    let task = TaskBuilder::new(job.id).build();
    h.add_job(&job, vec![task]);

    h.store
        .add_worker_to_job_blocklist(job.id, worker.id, "blender", start_time())
        .await
        .unwrap();
    assert!(h.scheduler.schedule_task(&worker).await.unwrap().is_none());
}

#[tokio::test]
async fn test_jobs_not_runnable_are_skipped() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);

    let paused = JobBuilder::new().with_status(JobStatus::Paused).build();
    let deleting = JobBuilder::new().deletion_requested(start_time()).build();
    h.add_job(&paused, vec![TaskBuilder::new(paused.id).build()]);
    h.add_job(&deleting, vec![TaskBuilder::new(deleting.id).build()]);

    assert!(h.scheduler.schedule_task(&worker).await.unwrap().is_none());
}

#[tokio::test]
async fn test_active_task_is_handed_back() {
    let h = Harness::new();
    let worker = WorkerBuilder::new().build();
    h.add_worker(&worker);
    let job = JobBuilder::new().with_status(JobStatus::Active).build();
    let active = TaskBuilder::new(job.id)
        .active_on(worker.id, start_time() - Duration::minutes(1))
        .build();
    let queued = TaskBuilder::new(job.id).build();
    h.add_job(&job, vec![active.clone(), queued]);

    let task = h.scheduler.schedule_task(&worker).await.unwrap().unwrap();
    assert_eq!(task.id, active.id);
    assert_eq!(
        h.store.task(active.id).unwrap().last_touched_at,
        Some(start_time())
    );
}
