//! 数据库结构
//!
//! 所有语句都是幂等的，每次启动都会执行一遍。

use renderfarm_core::{ManagerError, ManagerResult};
use sqlx::SqlitePool;
use tracing::debug;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS worker_tags (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        job_type TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 50,
        status TEXT NOT NULL,
        activity TEXT NOT NULL DEFAULT '',
        settings TEXT NOT NULL DEFAULT '{}',
        metadata TEXT NOT NULL DEFAULT '{}',
        worker_tag_id TEXT REFERENCES worker_tags(id) ON DELETE SET NULL,
        storage_shaman_checkout_id TEXT,
        delete_requested_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        address TEXT NOT NULL DEFAULT '',
        platform TEXT NOT NULL DEFAULT '',
        software TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        status_requested TEXT,
        lazy_status_request INTEGER NOT NULL DEFAULT 0,
        last_seen_at TEXT,
        can_restart INTEGER NOT NULL DEFAULT 0,
        supported_task_types TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        task_type TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 50,
        status TEXT NOT NULL,
        commands TEXT NOT NULL DEFAULT '[]',
        worker_id TEXT REFERENCES workers(id) ON DELETE SET NULL,
        last_touched_at TEXT,
        activity TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_dependencies (
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        dependency_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        PRIMARY KEY (task_id, dependency_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_tag_membership (
        worker_id TEXT NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
        tag_id TEXT NOT NULL REFERENCES worker_tags(id) ON DELETE CASCADE,
        PRIMARY KEY (worker_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_failures (
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        worker_id TEXT NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        PRIMARY KEY (task_id, worker_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_blocks (
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        worker_id TEXT NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
        task_type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (job_id, worker_id, task_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sleep_schedules (
        worker_id TEXT PRIMARY KEY REFERENCES workers(id) ON DELETE CASCADE,
        is_active INTEGER NOT NULL DEFAULT 0,
        days_of_week TEXT NOT NULL DEFAULT '',
        start_time TEXT,
        end_time TEXT,
        next_check TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_worker_id ON tasks(worker_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_last_touched_at ON tasks(last_touched_at)",
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_dependency_id ON task_dependencies(dependency_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_failures_worker_id ON task_failures(worker_id)",
    "CREATE INDEX IF NOT EXISTS idx_workers_last_seen_at ON workers(last_seen_at)",
    "CREATE INDEX IF NOT EXISTS idx_sleep_schedules_next_check ON sleep_schedules(next_check)",
];

/// 运行数据库迁移
pub async fn run_migrations(pool: &SqlitePool) -> ManagerResult<()> {
    debug!("运行SQLite数据库迁移");

    let mut tx = pool.begin().await.map_err(ManagerError::from_db)?;
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
    }
    tx.commit().await.map_err(ManagerError::from_db)?;

    debug!("SQLite数据库迁移完成");
    Ok(())
}
