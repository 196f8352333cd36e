use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use renderfarm_core::{DatabaseConfig, ManagerError, ManagerResult, Repositories};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info};

use super::migrations::run_migrations;
use super::sqlite::{
    SqliteBlocklistRepository, SqliteJobRepository, SqliteSleepScheduleRepository,
    SqliteTaskRepository, SqliteWorkerRepository, SqliteWorkerTagRepository,
};

/// 等待其他连接释放锁的时间，超过后返回繁忙错误
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// 数据库管理器：连接池、迁移、完整性检查以及仓储的构造
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 按配置打开数据库，启用外键约束和WAL模式
    pub async fn new(config: &DatabaseConfig) -> ManagerResult<Self> {
        debug!("打开SQLite数据库: {}", config.url);

        let connect_options = SqliteConnectOptions::from_str(&config.url)
            .map_err(ManagerError::from_db)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        // 每个内存数据库连接都是一个独立的库，只能用单个常驻连接
        let in_memory = config.url.contains(":memory:");
        let (max_connections, min_connections) = if in_memory {
            (1, 1)
        } else {
            (config.max_connections, config.min_connections)
        };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds));
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(ManagerError::from_db)?;

        Ok(Self { pool })
    }

    /// 打开并迁移一个内存数据库
    pub async fn in_memory() -> ManagerResult<Self> {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        };
        let manager = Self::new(&config).await?;
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> ManagerResult<()> {
        run_migrations(&self.pool).await
    }

    /// 检查数据库完整性与外键一致性，发现问题时返回 `Integrity` 错误
    pub async fn integrity_check(&self) -> ManagerResult<()> {
        let rows = sqlx::query("PRAGMA integrity_check")
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        let messages = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ManagerError::from_db)?;
        if messages.len() != 1 || messages[0] != "ok" {
            error!("数据库完整性检查失败: {:?}", messages);
            return Err(ManagerError::Integrity(messages.join("; ")));
        }

        let violations = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        if !violations.is_empty() {
            let tables = violations
                .iter()
                .map(|row| row.try_get::<String, _>(0))
                .collect::<Result<Vec<_>, _>>()
                .map_err(ManagerError::from_db)?;
            error!("发现 {} 条外键约束违规: {:?}", violations.len(), tables);
            return Err(ManagerError::Integrity(format!(
                "{} 条外键约束违规，涉及表: {}",
                violations.len(),
                tables.join(", ")
            )));
        }

        info!("数据库完整性检查通过");
        Ok(())
    }

    pub async fn health_check(&self) -> ManagerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// 构造共享同一连接池的全部仓储
    pub fn repositories(&self) -> Repositories {
        Repositories {
            jobs: Arc::new(SqliteJobRepository::new(self.pool.clone())),
            tasks: Arc::new(SqliteTaskRepository::new(self.pool.clone())),
            blocklist: Arc::new(SqliteBlocklistRepository::new(self.pool.clone())),
            workers: Arc::new(SqliteWorkerRepository::new(self.pool.clone())),
            worker_tags: Arc::new(SqliteWorkerTagRepository::new(self.pool.clone())),
            sleep_schedules: Arc::new(SqliteSleepScheduleRepository::new(self.pool.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_healthy() {
        let db = DatabaseManager::in_memory().await.unwrap();
        assert!(db.health_check().await.is_ok());
        assert!(db.integrity_check().await.is_ok());

        // 迁移可以重复执行
        assert!(db.migrate().await.is_ok());
        db.close().await;
    }

    #[tokio::test]
    async fn test_foreign_key_violation_fails_integrity_check() {
        let db = DatabaseManager::in_memory().await.unwrap();
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tasks (id, job_id, name, task_type, status, created_at, updated_at)
             VALUES ('t', 'no-such-job', 'orphan', 'misc', 'queued', '', '')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let err = db.integrity_check().await.unwrap_err();
        assert!(matches!(err, ManagerError::Integrity(_)));
    }
}
