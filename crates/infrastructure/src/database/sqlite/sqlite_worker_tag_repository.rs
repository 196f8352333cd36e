use async_trait::async_trait;
use renderfarm_core::{ManagerError, ManagerResult, WorkerTag, WorkerTagRepository};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

pub struct SqliteWorkerTagRepository {
    pool: SqlitePool,
}

impl SqliteWorkerTagRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_tag(row: &SqliteRow) -> ManagerResult<WorkerTag> {
        Ok(WorkerTag {
            id: MappingHelpers::parse_uuid(row, "id")?,
            name: row.try_get("name").map_err(ManagerError::from_db)?,
            description: row.try_get("description").map_err(ManagerError::from_db)?,
        })
    }
}

#[async_trait]
impl WorkerTagRepository for SqliteWorkerTagRepository {
    async fn create_worker_tag(&self, tag: &WorkerTag) -> ManagerResult<()> {
        sqlx::query("INSERT INTO worker_tags (id, name, description) VALUES (?1, ?2, ?3)")
            .bind(tag.id.to_string())
            .bind(&tag.name)
            .bind(&tag.description)
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Ok(())
    }

    async fn get_worker_tag(&self, tag_id: Uuid) -> ManagerResult<Option<WorkerTag>> {
        let row = sqlx::query("SELECT id, name, description FROM worker_tags WHERE id = ?1")
            .bind(tag_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        row.as_ref().map(Self::row_to_tag).transpose()
    }

    async fn list_worker_tags(&self) -> ManagerResult<Vec<WorkerTag>> {
        let rows = sqlx::query("SELECT id, name, description FROM worker_tags ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        rows.iter().map(Self::row_to_tag).collect()
    }

    async fn save_worker_tag(&self, tag: &WorkerTag) -> ManagerResult<()> {
        let result = sqlx::query("UPDATE worker_tags SET name = ?1, description = ?2 WHERE id = ?3")
            .bind(&tag.name)
            .bind(&tag.description)
            .bind(tag.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        if result.rows_affected() == 0 {
            return Err(ManagerError::WorkerTagNotFound { id: tag.id });
        }
        Ok(())
    }

    async fn delete_worker_tag(&self, tag_id: Uuid) -> ManagerResult<()> {
        let id = tag_id.to_string();
        let mut tx = self.pool.begin().await.map_err(ManagerError::from_db)?;

        sqlx::query("UPDATE jobs SET worker_tag_id = NULL WHERE worker_tag_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        sqlx::query("DELETE FROM worker_tag_membership WHERE tag_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        let result = sqlx::query("DELETE FROM worker_tags WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        if result.rows_affected() == 0 {
            return Err(ManagerError::WorkerTagNotFound { id: tag_id });
        }

        tx.commit().await.map_err(ManagerError::from_db)?;
        Ok(())
    }

    async fn set_worker_tags(&self, worker_id: Uuid, tag_ids: &[Uuid]) -> ManagerResult<()> {
        let id = worker_id.to_string();
        let mut tx = self.pool.begin().await.map_err(ManagerError::from_db)?;

        let exists = sqlx::query("SELECT 1 FROM workers WHERE id = ?1")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        if exists.is_none() {
            return Err(ManagerError::WorkerNotFound { id: worker_id });
        }

        sqlx::query("DELETE FROM worker_tag_membership WHERE worker_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        for tag_id in tag_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO worker_tag_membership (worker_id, tag_id) VALUES (?1, ?2)",
            )
            .bind(&id)
            .bind(tag_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(ManagerError::from_db)?;
        }

        tx.commit().await.map_err(ManagerError::from_db)?;
        Ok(())
    }
}
