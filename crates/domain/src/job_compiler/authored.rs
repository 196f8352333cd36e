use std::collections::HashMap;

use chrono::{DateTime, Utc};
use renderfarm_core::{Command, Job, JobStatus, ManagerError, ManagerResult, Task, TaskStatus};
use uuid::Uuid;

/// 新建任务的默认优先级
pub const DEFAULT_TASK_PRIORITY: i32 = 50;

/// 编译期间任务在作业中的临时下标
///
/// 依赖关系用下标表示，直到持久化时才转换为任务ID。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskIndex(usize);

impl TaskIndex {
    pub fn get(&self) -> usize {
        self.0
    }
}

/// 由作业类型编写出的任务
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoredTask {
    pub name: String,
    pub task_type: String,
    pub priority: i32,
    pub commands: Vec<Command>,
    dependencies: Vec<TaskIndex>,
}

impl AuthoredTask {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            priority: DEFAULT_TASK_PRIORITY,
            commands: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn dependencies(&self) -> &[TaskIndex] {
        &self.dependencies
    }
}

/// 编译结果：尚未持久化的作业及其任务图
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoredJob {
    pub job_id: Uuid,
    pub name: String,
    pub job_type: String,
    pub priority: i32,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub metadata: HashMap<String, String>,
    pub storage_shaman_checkout_id: Option<String>,
    pub worker_tag_id: Option<Uuid>,
    tasks: Vec<AuthoredTask>,
}

impl AuthoredJob {
    pub(crate) fn new(
        name: String,
        job_type: String,
        priority: i32,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            name,
            job_type,
            priority,
            status: JobStatus::UnderConstruction,
            created,
            settings: serde_json::Map::new(),
            metadata: HashMap::new(),
            storage_shaman_checkout_id: None,
            worker_tag_id: None,
            tasks: Vec::new(),
        }
    }

    pub fn add_task(&mut self, task: AuthoredTask) -> TaskIndex {
        self.tasks.push(task);
        TaskIndex(self.tasks.len() - 1)
    }

    /// 让 `task` 依赖 `depends_on`
    ///
    /// 只能依赖先于自己加入作业的任务，因此编出的图一定无环。
    pub fn add_dependency(&mut self, task: TaskIndex, depends_on: TaskIndex) -> ManagerResult<()> {
        if task.0 >= self.tasks.len() {
            return Err(ManagerError::Internal(format!("任务下标越界: {}", task.0)));
        }
        if depends_on.0 >= task.0 {
            return Err(ManagerError::Internal(format!(
                "任务 {} 只能依赖先创建的任务，不能依赖 {}",
                task.0, depends_on.0
            )));
        }

        let deps = &mut self.tasks[task.0].dependencies;
        if !deps.contains(&depends_on) {
            deps.push(depends_on);
        }
        Ok(())
    }

    pub fn tasks(&self) -> &[AuthoredTask] {
        &self.tasks
    }

    pub fn task(&self, index: TaskIndex) -> Option<&AuthoredTask> {
        self.tasks.get(index.0)
    }

    pub fn find_task(&self, name: &str) -> Option<(TaskIndex, &AuthoredTask)> {
        self.tasks
            .iter()
            .enumerate()
            .find(|(_, task)| task.name == name)
            .map(|(idx, task)| (TaskIndex(idx), task))
    }

    /// 转换为可持久化的记录，此时才为每个任务分配ID并把依赖下标翻译为ID
    pub fn to_records(&self, now: DateTime<Utc>) -> (Job, Vec<Task>) {
        let task_ids: Vec<Uuid> = self.tasks.iter().map(|_| Uuid::new_v4()).collect();

        let job = Job {
            id: self.job_id,
            name: self.name.clone(),
            job_type: self.job_type.clone(),
            priority: self.priority,
            status: self.status,
            activity: String::new(),
            settings: self.settings.clone(),
            metadata: self.metadata.clone(),
            worker_tag_id: self.worker_tag_id,
            storage_shaman_checkout_id: self.storage_shaman_checkout_id.clone(),
            delete_requested_at: None,
            created_at: self.created,
            updated_at: now,
        };

        let tasks = self
            .tasks
            .iter()
            .zip(&task_ids)
            .map(|(authored, &id)| Task {
                id,
                job_id: self.job_id,
                name: authored.name.clone(),
                task_type: authored.task_type.clone(),
                priority: authored.priority,
                status: TaskStatus::Queued,
                commands: authored.commands.clone(),
                worker_id: None,
                last_touched_at: None,
                activity: String::new(),
                dependencies: authored
                    .dependencies
                    .iter()
                    .map(|dep| task_ids[dep.0])
                    .collect(),
                created_at: now,
                updated_at: now,
            })
            .collect();

        (job, tasks)
    }
}
