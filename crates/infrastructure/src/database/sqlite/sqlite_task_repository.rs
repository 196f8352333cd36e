use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderfarm_core::{
    JobStatus, ManagerError, ManagerResult, Task, TaskRepository, TaskStatus, Worker,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

const TASK_COLUMNS: &str = "t.id AS id, t.job_id AS job_id, t.name AS name, \
     t.task_type AS task_type, t.priority AS priority, t.status AS status, t.commands AS commands, \
     t.worker_id AS worker_id, t.last_touched_at AS last_touched_at, t.activity AS activity, \
     t.created_at AS created_at, t.updated_at AS updated_at";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> ManagerResult<Task> {
        Ok(Task {
            id: MappingHelpers::parse_uuid(row, "id")?,
            job_id: MappingHelpers::parse_uuid(row, "job_id")?,
            name: row.try_get("name").map_err(ManagerError::from_db)?,
            task_type: row.try_get("task_type").map_err(ManagerError::from_db)?,
            priority: row.try_get("priority").map_err(ManagerError::from_db)?,
            status: row.try_get("status").map_err(ManagerError::from_db)?,
            commands: MappingHelpers::parse_json(row, "commands")?,
            worker_id: MappingHelpers::parse_opt_uuid(row, "worker_id")?,
            last_touched_at: MappingHelpers::parse_opt_time(row, "last_touched_at")?,
            activity: row.try_get("activity").map_err(ManagerError::from_db)?,
            // 依赖关系由 load_dependencies 单独查询填充
            dependencies: Vec::new(),
            created_at: MappingHelpers::parse_time(row, "created_at")?,
            updated_at: MappingHelpers::parse_time(row, "updated_at")?,
        })
    }

    /// 把查询结果转换为任务，并批量填充它们的依赖
    async fn tasks_from_rows(&self, rows: &[SqliteRow]) -> ManagerResult<Vec<Task>> {
        let mut tasks = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<ManagerResult<Vec<_>>>()?;
        self.load_dependencies(&mut tasks).await?;
        Ok(tasks)
    }

    async fn load_dependencies(&self, tasks: &mut [Task]) -> ManagerResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "SELECT task_id, dependency_id FROM task_dependencies \
             WHERE task_id IN ({}) ORDER BY rowid",
            MappingHelpers::placeholders(1, tasks.len())
        );
        let mut query = sqlx::query(&sql);
        for task in tasks.iter() {
            query = query.bind(task.id.to_string());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;

        let mut dependencies: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for row in &rows {
            let task_id = MappingHelpers::parse_uuid(row, "task_id")?;
            let dependency_id = MappingHelpers::parse_uuid(row, "dependency_id")?;
            dependencies.entry(task_id).or_default().push(dependency_id);
        }
        for task in tasks.iter_mut() {
            task.dependencies = dependencies.remove(&task.id).unwrap_or_default();
        }
        Ok(())
    }

    async fn fetch_where(&self, condition: &str, binds: &[String]) -> ManagerResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE {condition} ORDER BY t.rowid");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        self.tasks_from_rows(&rows).await
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn get_task(&self, task_id: Uuid) -> ManagerResult<Option<Task>> {
        let mut tasks = self.fetch_where("t.id = ?1", &[task_id.to_string()]).await?;
        Ok(tasks.pop())
    }

    async fn save_task(&self, task: &Task) -> ManagerResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, worker_id = ?2, activity = ?3, last_touched_at = ?4, \
             priority = ?5, updated_at = ?6 WHERE id = ?7",
        )
        .bind(task.status)
        .bind(task.worker_id.map(|id| id.to_string()))
        .bind(&task.activity)
        .bind(MappingHelpers::format_opt_time(task.last_touched_at))
        .bind(task.priority)
        .bind(MappingHelpers::format_time(task.updated_at))
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        if result.rows_affected() == 0 {
            return Err(ManagerError::TaskNotFound { id: task.id });
        }
        Ok(())
    }

    async fn save_task_activity(&self, task: &Task) -> ManagerResult<()> {
        let result = sqlx::query("UPDATE tasks SET activity = ?1 WHERE id = ?2")
            .bind(&task.activity)
            .bind(task.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        if result.rows_affected() == 0 {
            return Err(ManagerError::TaskNotFound { id: task.id });
        }
        Ok(())
    }

    async fn touch_task(&self, task_id: Uuid, now: DateTime<Utc>) -> ManagerResult<()> {
        let result = sqlx::query("UPDATE tasks SET last_touched_at = ?1 WHERE id = ?2")
            .bind(MappingHelpers::format_time(now))
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        if result.rows_affected() == 0 {
            return Err(ManagerError::TaskNotFound { id: task_id });
        }
        Ok(())
    }

    async fn fetch_tasks_of_job(&self, job_id: Uuid) -> ManagerResult<Vec<Task>> {
        self.fetch_where("t.job_id = ?1", &[job_id.to_string()]).await
    }

    async fn fetch_tasks_of_job_in_status(
        &self,
        job_id: Uuid,
        statuses: &[TaskStatus],
    ) -> ManagerResult<Vec<Task>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let condition = format!(
            "t.job_id = ?1 AND t.status IN ({})",
            MappingHelpers::placeholders(2, statuses.len())
        );
        let mut binds = vec![job_id.to_string()];
        binds.extend(statuses.iter().map(|s| s.as_str().to_string()));
        self.fetch_where(&condition, &binds).await
    }

    async fn fetch_tasks_of_worker_in_status(
        &self,
        worker_id: Uuid,
        status: TaskStatus,
    ) -> ManagerResult<Vec<Task>> {
        self.fetch_where(
            "t.worker_id = ?1 AND t.status = ?2",
            &[worker_id.to_string(), status.as_str().to_string()],
        )
        .await
    }

    async fn count_tasks_of_job_by_status(
        &self,
        job_id: Uuid,
    ) -> ManagerResult<HashMap<TaskStatus, i64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS num_tasks FROM tasks WHERE job_id = ?1 GROUP BY status",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;

        let mut counts = HashMap::new();
        for row in &rows {
            let status: TaskStatus = row.try_get("status").map_err(ManagerError::from_db)?;
            let count: i64 = row.try_get("num_tasks").map_err(ManagerError::from_db)?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    async fn update_job_task_statuses(
        &self,
        job_id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        activity: &str,
        now: DateTime<Utc>,
    ) -> ManagerResult<u64> {
        if from.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE tasks SET status = ?1, activity = ?2, updated_at = ?3 \
             WHERE job_id = ?4 AND status IN ({})",
            MappingHelpers::placeholders(5, from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to)
            .bind(activity)
            .bind(MappingHelpers::format_time(now))
            .bind(job_id.to_string());
        for status in from {
            query = query.bind(*status);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Ok(result.rows_affected())
    }

    async fn fetch_timed_out_tasks(
        &self,
        untouched_since: DateTime<Utc>,
    ) -> ManagerResult<Vec<Task>> {
        self.fetch_where(
            "t.status = ?1 AND t.last_touched_at IS NOT NULL AND t.last_touched_at < ?2",
            &[
                TaskStatus::Active.as_str().to_string(),
                MappingHelpers::format_time(untouched_since),
            ],
        )
        .await
    }

    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn find_runnable_task(&self, worker: &Worker) -> ManagerResult<Option<Task>> {
        let task_types: Vec<&str> = worker.task_types().collect();
        if task_types.is_empty() {
            debug!("Worker不支持任何任务类型");
            return Ok(None);
        }

        // ?1 Worker ID, ?2 已完成状态, 之后依次是任务类型
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             JOIN jobs j ON j.id = t.job_id \
             WHERE t.status IN ('{queued}', '{soft_failed}') \
               AND j.status IN ('{job_queued}', '{job_active}') \
               AND j.delete_requested_at IS NULL \
               AND t.task_type IN ({task_types}) \
               AND (j.worker_tag_id IS NULL OR j.worker_tag_id IN \
                    (SELECT m.tag_id FROM worker_tag_membership m WHERE m.worker_id = ?1)) \
               AND NOT EXISTS (SELECT 1 FROM job_blocks b \
                    WHERE b.job_id = j.id AND b.worker_id = ?1 AND b.task_type = t.task_type) \
               AND NOT EXISTS (SELECT 1 FROM task_failures f \
                    WHERE f.task_id = t.id AND f.worker_id = ?1) \
               AND NOT EXISTS (SELECT 1 FROM task_dependencies d \
                    JOIN tasks dep ON dep.id = d.dependency_id \
                    WHERE d.task_id = t.id AND dep.status <> ?2) \
             ORDER BY j.priority DESC, t.priority DESC, t.created_at ASC, t.rowid ASC \
             LIMIT 1",
            queued = TaskStatus::Queued.as_str(),
            soft_failed = TaskStatus::SoftFailed.as_str(),
            job_queued = JobStatus::Queued.as_str(),
            job_active = JobStatus::Active.as_str(),
            task_types = MappingHelpers::placeholders(3, task_types.len()),
        );

        let mut query = sqlx::query(&sql)
            .bind(worker.id.to_string())
            .bind(TaskStatus::Completed);
        for task_type in &task_types {
            query = query.bind(*task_type);
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut tasks = self.tasks_from_rows(std::slice::from_ref(&row)).await?;
        Ok(tasks.pop())
    }
}
