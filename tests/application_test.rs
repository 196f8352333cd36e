use std::time::Duration;

use renderfarm::app::Application;
use renderfarm::shutdown::ShutdownManager;
use renderfarm_core::{AppConfig, ChangeEvent, DatabaseConfig, JobStatus, ManagerError};
use renderfarm_domain::SubmittedJob;
use serde_json::json;
use tokio::time::timeout;

fn in_memory_config() -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            integrity_check_interval_seconds: 0,
            ..DatabaseConfig::default()
        },
        ..AppConfig::default()
    }
}

fn echo_submission() -> SubmittedJob {
    SubmittedJob {
        name: "smoke test".to_string(),
        job_type: "echo-sleep-test".to_string(),
        priority: 50,
        settings: json!({"message": "hello"}).as_object().unwrap().clone(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_application_serves_jobs_and_broadcasts_changes() {
    let app = Application::new(in_memory_config()).await.unwrap();
    let mut changes = app.subscribe_changes();

    let job = app.job_service().submit_job(&echo_submission()).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let event = timeout(Duration::from_millis(100), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ChangeEvent::Job(update) if update.id == job.id));

    let stored = app.job_service().fetch_job(job.id).await.unwrap();
    assert_eq!(stored.name, "smoke test");
    assert!(app.worker_service().list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_application_stops_on_shutdown() {
    let app = std::sync::Arc::new(Application::new(in_memory_config()).await.unwrap());
    app.database().health_check().await.unwrap();

    let shutdown_manager = ShutdownManager::new();
    let shutdown_rx = shutdown_manager.subscribe().await;
    let handle = {
        let app = app.clone();
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    shutdown_manager.shutdown().await;
    let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_application_rejects_unknown_job_type() {
    let app = Application::new(in_memory_config()).await.unwrap();
    let submission = SubmittedJob {
        job_type: "no-such-type".to_string(),
        ..echo_submission()
    };
    let err = app.job_service().submit_job(&submission).await.unwrap_err();
    assert!(matches!(err, ManagerError::JobTypeUnknown(_)));
    assert!(app.job_service().list_jobs().await.unwrap().is_empty());
}
