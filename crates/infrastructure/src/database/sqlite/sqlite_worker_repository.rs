use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderfarm_core::{
    ManagerError, ManagerResult, Worker, WorkerRepository, WorkerStatus, WorkerTag,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

const WORKER_COLUMNS: &str = "id, name, address, platform, software, status, status_requested, \
     lazy_status_request, last_seen_at, can_restart, supported_task_types, created_at, updated_at";

pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &SqliteRow) -> ManagerResult<Worker> {
        Ok(Worker {
            id: MappingHelpers::parse_uuid(row, "id")?,
            name: row.try_get("name").map_err(ManagerError::from_db)?,
            address: row.try_get("address").map_err(ManagerError::from_db)?,
            platform: row.try_get("platform").map_err(ManagerError::from_db)?,
            software: row.try_get("software").map_err(ManagerError::from_db)?,
            status: row.try_get("status").map_err(ManagerError::from_db)?,
            status_requested: row.try_get("status_requested").map_err(ManagerError::from_db)?,
            lazy_status_request: row
                .try_get("lazy_status_request")
                .map_err(ManagerError::from_db)?,
            last_seen_at: MappingHelpers::parse_opt_time(row, "last_seen_at")?,
            can_restart: row.try_get("can_restart").map_err(ManagerError::from_db)?,
            supported_task_types: row
                .try_get("supported_task_types")
                .map_err(ManagerError::from_db)?,
            tags: Vec::new(),
            created_at: MappingHelpers::parse_time(row, "created_at")?,
            updated_at: MappingHelpers::parse_time(row, "updated_at")?,
        })
    }

    async fn workers_from_rows(&self, rows: &[SqliteRow]) -> ManagerResult<Vec<Worker>> {
        let mut workers = rows
            .iter()
            .map(Self::row_to_worker)
            .collect::<ManagerResult<Vec<_>>>()?;
        self.load_tags(&mut workers).await?;
        Ok(workers)
    }

    async fn load_tags(&self, workers: &mut [Worker]) -> ManagerResult<()> {
        if workers.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "SELECT m.worker_id, wt.id, wt.name, wt.description FROM worker_tag_membership m \
             JOIN worker_tags wt ON wt.id = m.tag_id \
             WHERE m.worker_id IN ({}) ORDER BY wt.name",
            MappingHelpers::placeholders(1, workers.len())
        );
        let mut query = sqlx::query(&sql);
        for worker in workers.iter() {
            query = query.bind(worker.id.to_string());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;

        let mut tags: HashMap<Uuid, Vec<WorkerTag>> = HashMap::new();
        for row in &rows {
            let worker_id = MappingHelpers::parse_uuid(row, "worker_id")?;
            tags.entry(worker_id).or_default().push(WorkerTag {
                id: MappingHelpers::parse_uuid(row, "id")?,
                name: row.try_get("name").map_err(ManagerError::from_db)?,
                description: row.try_get("description").map_err(ManagerError::from_db)?,
            });
        }
        for worker in workers.iter_mut() {
            worker.tags = tags.remove(&worker.id).unwrap_or_default();
        }
        Ok(())
    }

    fn ensure_updated(result: sqlx::sqlite::SqliteQueryResult, worker_id: Uuid) -> ManagerResult<()> {
        if result.rows_affected() == 0 {
            return Err(ManagerError::WorkerNotFound { id: worker_id });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn create_worker(&self, worker: &Worker) -> ManagerResult<()> {
        let mut tx = self.pool.begin().await.map_err(ManagerError::from_db)?;

        sqlx::query(&format!(
            "INSERT INTO workers ({WORKER_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ))
        .bind(worker.id.to_string())
        .bind(&worker.name)
        .bind(&worker.address)
        .bind(&worker.platform)
        .bind(&worker.software)
        .bind(worker.status)
        .bind(worker.status_requested)
        .bind(worker.lazy_status_request)
        .bind(MappingHelpers::format_opt_time(worker.last_seen_at))
        .bind(worker.can_restart)
        .bind(&worker.supported_task_types)
        .bind(MappingHelpers::format_time(worker.created_at))
        .bind(MappingHelpers::format_time(worker.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(ManagerError::from_db)?;

        for tag in &worker.tags {
            sqlx::query(
                "INSERT OR IGNORE INTO worker_tags (id, name, description) VALUES (?1, ?2, ?3)",
            )
            .bind(tag.id.to_string())
            .bind(&tag.name)
            .bind(&tag.description)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
            sqlx::query(
                "INSERT OR IGNORE INTO worker_tag_membership (worker_id, tag_id) VALUES (?1, ?2)",
            )
            .bind(worker.id.to_string())
            .bind(tag.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        }

        tx.commit().await.map_err(ManagerError::from_db)?;
        debug!("Worker {} 已保存", worker.identifier());
        Ok(())
    }

    async fn get_worker(&self, worker_id: Uuid) -> ManagerResult<Option<Worker>> {
        let rows = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"))
            .bind(worker_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Ok(self.workers_from_rows(&rows).await?.pop())
    }

    async fn list_workers(&self) -> ManagerResult<Vec<Worker>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers ORDER BY name, rowid"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        self.workers_from_rows(&rows).await
    }

    async fn save_worker(&self, worker: &Worker) -> ManagerResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET name = ?1, address = ?2, platform = ?3, software = ?4, \
             status = ?5, status_requested = ?6, lazy_status_request = ?7, last_seen_at = ?8, \
             can_restart = ?9, supported_task_types = ?10, updated_at = ?11 WHERE id = ?12",
        )
        .bind(&worker.name)
        .bind(&worker.address)
        .bind(&worker.platform)
        .bind(&worker.software)
        .bind(worker.status)
        .bind(worker.status_requested)
        .bind(worker.lazy_status_request)
        .bind(MappingHelpers::format_opt_time(worker.last_seen_at))
        .bind(worker.can_restart)
        .bind(&worker.supported_task_types)
        .bind(MappingHelpers::format_time(worker.updated_at))
        .bind(worker.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        Self::ensure_updated(result, worker.id)
    }

    async fn save_worker_status(&self, worker: &Worker) -> ManagerResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET status = ?1, status_requested = ?2, lazy_status_request = ?3, \
             updated_at = ?4 WHERE id = ?5",
        )
        .bind(worker.status)
        .bind(worker.status_requested)
        .bind(worker.lazy_status_request)
        .bind(MappingHelpers::format_time(worker.updated_at))
        .bind(worker.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        Self::ensure_updated(result, worker.id)
    }

    async fn worker_seen(&self, worker_id: Uuid, now: DateTime<Utc>) -> ManagerResult<()> {
        let result = sqlx::query("UPDATE workers SET last_seen_at = ?1 WHERE id = ?2")
            .bind(MappingHelpers::format_time(now))
            .bind(worker_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Self::ensure_updated(result, worker_id)
    }

    async fn fetch_timed_out_workers(
        &self,
        last_seen_before: DateTime<Utc>,
    ) -> ManagerResult<Vec<Worker>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers \
             WHERE status NOT IN (?1, ?2) AND last_seen_at IS NOT NULL AND last_seen_at < ?3 \
             ORDER BY rowid"
        ))
        .bind(WorkerStatus::Error)
        .bind(WorkerStatus::Offline)
        .bind(MappingHelpers::format_time(last_seen_before))
        .fetch_all(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        self.workers_from_rows(&rows).await
    }

    #[instrument(skip(self))]
    async fn delete_worker(&self, worker_id: Uuid) -> ManagerResult<()> {
        let id = worker_id.to_string();
        let mut tx = self.pool.begin().await.map_err(ManagerError::from_db)?;

        let statements = [
            "UPDATE tasks SET worker_id = NULL WHERE worker_id = ?1",
            "DELETE FROM worker_tag_membership WHERE worker_id = ?1",
            "DELETE FROM sleep_schedules WHERE worker_id = ?1",
            "DELETE FROM task_failures WHERE worker_id = ?1",
            "DELETE FROM job_blocks WHERE worker_id = ?1",
        ];
        for statement in statements {
            sqlx::query(statement)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(ManagerError::from_db)?;
        }

        let result = sqlx::query("DELETE FROM workers WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        Self::ensure_updated(result, worker_id)?;

        tx.commit().await.map_err(ManagerError::from_db)?;
        Ok(())
    }
}
