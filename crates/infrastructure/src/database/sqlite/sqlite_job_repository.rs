use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderfarm_core::{Job, JobRepository, ManagerError, ManagerResult, Task};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

const JOB_COLUMNS: &str = "id, name, job_type, priority, status, activity, settings, metadata, \
     worker_tag_id, storage_shaman_checkout_id, delete_requested_at, created_at, updated_at";

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &SqliteRow) -> ManagerResult<Job> {
        Ok(Job {
            id: MappingHelpers::parse_uuid(row, "id")?,
            name: row.try_get("name").map_err(ManagerError::from_db)?,
            job_type: row.try_get("job_type").map_err(ManagerError::from_db)?,
            priority: row.try_get("priority").map_err(ManagerError::from_db)?,
            status: row.try_get("status").map_err(ManagerError::from_db)?,
            activity: row.try_get("activity").map_err(ManagerError::from_db)?,
            settings: MappingHelpers::parse_json(row, "settings")?,
            metadata: MappingHelpers::parse_json(row, "metadata")?,
            worker_tag_id: MappingHelpers::parse_opt_uuid(row, "worker_tag_id")?,
            storage_shaman_checkout_id: row
                .try_get("storage_shaman_checkout_id")
                .map_err(ManagerError::from_db)?,
            delete_requested_at: MappingHelpers::parse_opt_time(row, "delete_requested_at")?,
            created_at: MappingHelpers::parse_time(row, "created_at")?,
            updated_at: MappingHelpers::parse_time(row, "updated_at")?,
        })
    }

    fn ensure_updated(result: sqlx::sqlite::SqliteQueryResult, job_id: Uuid) -> ManagerResult<()> {
        if result.rows_affected() == 0 {
            return Err(ManagerError::JobNotFound { id: job_id });
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self, job, tasks), fields(job_id = %job.id, num_tasks = tasks.len()))]
    async fn store_job(&self, job: &Job, tasks: &[Task]) -> ManagerResult<()> {
        let mut tx = self.pool.begin().await.map_err(ManagerError::from_db)?;

        sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ))
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(&job.job_type)
        .bind(job.priority)
        .bind(job.status)
        .bind(&job.activity)
        .bind(serde_json::to_string(&job.settings)?)
        .bind(serde_json::to_string(&job.metadata)?)
        .bind(job.worker_tag_id.map(|id| id.to_string()))
        .bind(&job.storage_shaman_checkout_id)
        .bind(MappingHelpers::format_opt_time(job.delete_requested_at))
        .bind(MappingHelpers::format_time(job.created_at))
        .bind(MappingHelpers::format_time(job.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(ManagerError::from_db)?;

        for task in tasks {
            sqlx::query(
                "INSERT INTO tasks (id, job_id, name, task_type, priority, status, commands, \
                 worker_id, last_touched_at, activity, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )
            .bind(task.id.to_string())
            .bind(job.id.to_string())
            .bind(&task.name)
            .bind(&task.task_type)
            .bind(task.priority)
            .bind(task.status)
            .bind(serde_json::to_string(&task.commands)?)
            .bind(task.worker_id.map(|id| id.to_string()))
            .bind(MappingHelpers::format_opt_time(task.last_touched_at))
            .bind(&task.activity)
            .bind(MappingHelpers::format_time(task.created_at))
            .bind(MappingHelpers::format_time(task.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        }

        // 依赖关系在全部任务插入之后写入，外键才能引用到被依赖的任务
        for task in tasks {
            for dependency in &task.dependencies {
                sqlx::query(
                    "INSERT OR IGNORE INTO task_dependencies (task_id, dependency_id) VALUES (?1, ?2)",
                )
                .bind(task.id.to_string())
                .bind(dependency.to_string())
                .execute(&mut *tx)
                .await
                .map_err(ManagerError::from_db)?;
            }
        }

        tx.commit().await.map_err(ManagerError::from_db)?;
        debug!("作业及其 {} 个任务已保存", tasks.len());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> ManagerResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list_jobs(&self) -> ManagerResult<Vec<Job>> {
        let rows = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY rowid"))
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn save_job_status(&self, job: &Job) -> ManagerResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?1, activity = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(job.status)
        .bind(&job.activity)
        .bind(MappingHelpers::format_time(job.updated_at))
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        Self::ensure_updated(result, job.id)
    }

    async fn save_job_priority(&self, job: &Job) -> ManagerResult<()> {
        let result = sqlx::query("UPDATE jobs SET priority = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(job.priority)
            .bind(MappingHelpers::format_time(job.updated_at))
            .bind(job.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Self::ensure_updated(result, job.id)
    }

    async fn request_job_deletion(&self, job: &Job) -> ManagerResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET delete_requested_at = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(MappingHelpers::format_opt_time(job.delete_requested_at))
        .bind(MappingHelpers::format_time(job.updated_at))
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        Self::ensure_updated(result, job.id)
    }

    async fn fetch_jobs_deletion_requested(&self) -> ManagerResult<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE delete_requested_at IS NOT NULL \
             ORDER BY delete_requested_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        rows.iter()
            .map(|row| MappingHelpers::parse_uuid(row, "id"))
            .collect()
    }

    async fn fetch_jobs_last_updated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> ManagerResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE updated_at < ?1 ORDER BY rowid")
            .bind(MappingHelpers::format_time(cutoff))
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        rows.iter()
            .map(|row| MappingHelpers::parse_uuid(row, "id"))
            .collect()
    }

    #[instrument(skip(self))]
    async fn delete_job(&self, job_id: Uuid) -> ManagerResult<()> {
        let id = job_id.to_string();
        let mut tx = self.pool.begin().await.map_err(ManagerError::from_db)?;

        let statements = [
            "DELETE FROM task_failures WHERE task_id IN (SELECT id FROM tasks WHERE job_id = ?1)",
            "DELETE FROM task_dependencies WHERE task_id IN (SELECT id FROM tasks WHERE job_id = ?1)",
            "DELETE FROM job_blocks WHERE job_id = ?1",
            "DELETE FROM tasks WHERE job_id = ?1",
        ];
        for statement in statements {
            sqlx::query(statement)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(ManagerError::from_db)?;
        }

        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        if result.rows_affected() == 0 {
            return Err(ManagerError::JobNotFound { id: job_id });
        }

        tx.commit().await.map_err(ManagerError::from_db)?;
        Ok(())
    }
}
