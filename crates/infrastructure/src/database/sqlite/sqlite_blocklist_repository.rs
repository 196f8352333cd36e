use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderfarm_core::{
    BlocklistRepository, Job, JobBlock, ManagerError, ManagerResult, Task,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

/// 任务失败记录与作业黑名单
pub struct SqliteBlocklistRepository {
    pool: SqlitePool,
}

impl SqliteBlocklistRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn count(&self, sql: &str, binds: &[String]) -> ManagerResult<i64> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        row.try_get(0).map_err(ManagerError::from_db)
    }
}

#[async_trait]
impl BlocklistRepository for SqliteBlocklistRepository {
    async fn add_task_failure(
        &self,
        task: &Task,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> ManagerResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO task_failures (task_id, worker_id, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(task.id.to_string())
        .bind(worker_id.to_string())
        .bind(MappingHelpers::format_time(now))
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_workers_failed_task_type(
        &self,
        job_id: Uuid,
        task_type: &str,
    ) -> ManagerResult<i64> {
        self.count(
            "SELECT COUNT(DISTINCT f.worker_id) FROM task_failures f \
             JOIN tasks t ON t.id = f.task_id \
             WHERE t.job_id = ?1 AND t.task_type = ?2",
            &[job_id.to_string(), task_type.to_string()],
        )
        .await
    }

    async fn count_task_failures_of_worker(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        task_type: &str,
    ) -> ManagerResult<i64> {
        self.count(
            "SELECT COUNT(*) FROM task_failures f \
             JOIN tasks t ON t.id = f.task_id \
             WHERE t.job_id = ?1 AND f.worker_id = ?2 AND t.task_type = ?3",
            &[job_id.to_string(), worker_id.to_string(), task_type.to_string()],
        )
        .await
    }

    async fn fetch_task_failure_list(&self, task_id: Uuid) -> ManagerResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT worker_id FROM task_failures WHERE task_id = ?1 ORDER BY rowid")
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        rows.iter()
            .map(|row| MappingHelpers::parse_uuid(row, "worker_id"))
            .collect()
    }

    async fn clear_failure_list_of_task(&self, task_id: Uuid) -> ManagerResult<()> {
        sqlx::query("DELETE FROM task_failures WHERE task_id = ?1")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Ok(())
    }

    async fn clear_failure_list_of_job(&self, job_id: Uuid) -> ManagerResult<()> {
        let result = sqlx::query(
            "DELETE FROM task_failures WHERE task_id IN (SELECT id FROM tasks WHERE job_id = ?1)",
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        debug!(job_id = %job_id, removed = result.rows_affected(), "清除作业的任务失败记录");
        Ok(())
    }

    async fn add_worker_to_job_blocklist(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        task_type: &str,
        now: DateTime<Utc>,
    ) -> ManagerResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO job_blocks (job_id, worker_id, task_type, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(job_id.to_string())
        .bind(worker_id.to_string())
        .bind(task_type)
        .bind(MappingHelpers::format_time(now))
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        Ok(())
    }

    async fn fetch_job_blocklist(&self, job_id: Uuid) -> ManagerResult<Vec<JobBlock>> {
        let rows = sqlx::query(
            "SELECT job_id, worker_id, task_type FROM job_blocks WHERE job_id = ?1 ORDER BY rowid",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;

        rows.iter()
            .map(|row| {
                Ok(JobBlock {
                    job_id: MappingHelpers::parse_uuid(row, "job_id")?,
                    worker_id: MappingHelpers::parse_uuid(row, "worker_id")?,
                    task_type: row.try_get("task_type").map_err(ManagerError::from_db)?,
                })
            })
            .collect()
    }

    async fn remove_from_job_blocklist(&self, entries: &[JobBlock]) -> ManagerResult<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(ManagerError::from_db)?;
        let mut removed = 0;
        for entry in entries {
            let result = sqlx::query(
                "DELETE FROM job_blocks WHERE job_id = ?1 AND worker_id = ?2 AND task_type = ?3",
            )
            .bind(entry.job_id.to_string())
            .bind(entry.worker_id.to_string())
            .bind(&entry.task_type)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
            removed += result.rows_affected();
        }
        tx.commit().await.map_err(ManagerError::from_db)?;
        Ok(removed)
    }

    async fn clear_job_blocklist(&self, job_id: Uuid) -> ManagerResult<()> {
        sqlx::query("DELETE FROM job_blocks WHERE job_id = ?1")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Ok(())
    }

    async fn workers_left_to_run(&self, job: &Job, task_type: &str) -> ManagerResult<Vec<Uuid>> {
        // 支持的任务类型以逗号分隔保存，匹配在查询之后进行
        let rows = sqlx::query(
            "SELECT w.id, w.supported_task_types FROM workers w \
             WHERE (?1 IS NULL OR EXISTS (SELECT 1 FROM worker_tag_membership m \
                    WHERE m.worker_id = w.id AND m.tag_id = ?1)) \
               AND NOT EXISTS (SELECT 1 FROM job_blocks b \
                    WHERE b.job_id = ?2 AND b.worker_id = w.id AND b.task_type = ?3) \
             ORDER BY w.rowid",
        )
        .bind(job.worker_tag_id.map(|id| id.to_string()))
        .bind(job.id.to_string())
        .bind(task_type)
        .fetch_all(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;

        let mut workers = Vec::new();
        for row in &rows {
            let supported: String = row
                .try_get("supported_task_types")
                .map_err(ManagerError::from_db)?;
            if supported.split(',').map(str::trim).any(|t| t == task_type) {
                workers.push(MappingHelpers::parse_uuid(row, "id")?);
            }
        }
        Ok(workers)
    }
}
