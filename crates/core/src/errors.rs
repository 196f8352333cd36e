use thiserror::Error;
use uuid::Uuid;

/// 渲染农场管理器错误类型定义
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库繁忙，请稍后重试: {0}")]
    StoreBusy(String),

    #[error("数据库完整性检查失败: {0}")]
    Integrity(String),

    #[error("作业未找到: {id}")]
    JobNotFound { id: Uuid },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: Uuid },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: Uuid },

    #[error("Worker标签未找到: {id}")]
    WorkerTagNotFound { id: Uuid },

    #[error("Worker {worker_id} 没有睡眠计划")]
    SleepScheduleNotFound { worker_id: Uuid },

    #[error("没有最后更新时间早于 {cutoff} 的作业")]
    NoMatchingJobs { cutoff: String },

    #[error("任务 {task_id} 没有分配给Worker {worker_id}")]
    TaskNotAssigned { task_id: Uuid, worker_id: Uuid },

    #[error("非法的{entity}状态转换: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("未知的作业类型: {0}")]
    JobTypeUnknown(String),

    #[error("作业类型 {job_type} 的etag不匹配: 提交的是 {submitted}, 当前是 {current}")]
    JobTypeBadEtag {
        job_type: String,
        submitted: String,
        current: String,
    },

    #[error("作业设置无效: {0}")]
    InvalidJobSettings(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl ManagerError {
    /// 将sqlx错误转换为管理器错误，SQLite的繁忙/锁定错误单独归类为 `StoreBusy`
    pub fn from_db(err: sqlx::Error) -> Self {
        if is_busy_error(&err) {
            return ManagerError::StoreBusy(err.to_string());
        }
        ManagerError::Database(err)
    }

    /// 是否属于"未找到"类错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ManagerError::JobNotFound { .. }
                | ManagerError::TaskNotFound { .. }
                | ManagerError::WorkerNotFound { .. }
                | ManagerError::WorkerTagNotFound { .. }
                | ManagerError::SleepScheduleNotFound { .. }
                | ManagerError::NoMatchingJobs { .. }
                | ManagerError::Database(sqlx::Error::RowNotFound)
        )
    }

    pub fn is_store_busy(&self) -> bool {
        matches!(self, ManagerError::StoreBusy(_))
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        ManagerError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        ManagerError::Serialization(err.to_string())
    }
}

// SQLITE_BUSY = 5, SQLITE_LOCKED = 6, SQLITE_BUSY_SNAPSHOT = 517
fn is_busy_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code_is_busy = db_err
                .code()
                .map(|code| matches!(code.as_ref(), "5" | "6" | "517"))
                .unwrap_or(false);
            code_is_busy
                || db_err.message().contains("database is locked")
                || db_err.message().contains("SQLITE_BUSY")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// 统一的Result类型
pub type ManagerResult<T> = std::result::Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let id = Uuid::new_v4();
        assert!(ManagerError::JobNotFound { id }.is_not_found());
        assert!(ManagerError::WorkerNotFound { id }.is_not_found());
        assert!(!ManagerError::StoreBusy("locked".into()).is_not_found());
        assert!(!ManagerError::JobTypeUnknown("x".into()).is_not_found());
    }

    #[test]
    fn test_pool_timeout_is_busy() {
        let err = ManagerError::from_db(sqlx::Error::PoolTimedOut);
        assert!(err.is_store_busy());

        let err = ManagerError::from_db(sqlx::Error::RowNotFound);
        assert!(!err.is_store_busy());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = ManagerError::invalid_transition("任务", "completed", "active");
        assert_eq!(err.to_string(), "非法的任务状态转换: completed -> active");
    }
}
