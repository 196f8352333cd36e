//! 作业编译器
//!
//! 每种作业类型是一个实现了 [`JobType`] 的策略，按类型名注册到
//! [`JobCompiler`] 中。编译把提交的作业转换为 [`AuthoredJob`]：
//! 一个带有新作业ID、处于 `under-construction` 状态的作业以及任务依赖图。
//!
//! 编译是纯计算，不做任何持久化；同一份提交在同一描述下总是产生相同的任务图。

mod authored;
mod descriptor;
pub mod frames;
pub mod simple_blender_render;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use renderfarm_core::{Clock, ManagerError, ManagerResult};

pub use authored::{AuthoredJob, AuthoredTask, TaskIndex, DEFAULT_TASK_PRIORITY};
pub use descriptor::{JobTypeDescriptor, JobTypeInfo, SettingDescriptor, SettingType};

/// 作业类型策略
pub trait JobType: Send + Sync {
    /// 作业类型的设置结构，类型名取自 `descriptor().name`
    fn descriptor(&self) -> JobTypeDescriptor;

    /// 向作业中添加任务及其依赖；此时设置已补全默认值并通过校验
    fn compile(&self, job: &mut AuthoredJob) -> ManagerResult<()>;
}

/// 用户提交的作业
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubmittedJob {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: i32,
    /// 提交方编写作业时所依据的作业类型etag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_etag: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub submitter_platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_shaman_checkout_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_tag_id: Option<Uuid>,
}

/// 作业类型注册表与编译入口
pub struct JobCompiler {
    job_types: HashMap<String, Arc<dyn JobType>>,
    clock: Arc<dyn Clock>,
}

impl JobCompiler {
    /// 创建不含任何作业类型的编译器
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            job_types: HashMap::new(),
            clock,
        }
    }

    /// 创建注册了全部内置作业类型的编译器
    pub fn with_builtin_job_types(clock: Arc<dyn Clock>) -> Self {
        let mut compiler = Self::new(clock);
        compiler.register(Arc::new(simple_blender_render::SimpleBlenderRender));
        compiler.register(Arc::new(echo_sleep_test::EchoSleepTest));
        compiler
    }

    /// 注册作业类型，同名类型会被替换
    pub fn register(&mut self, job_type: Arc<dyn JobType>) {
        let name = job_type.descriptor().name;
        debug!(job_type = %name, "注册作业类型");
        self.job_types.insert(name, job_type);
    }

    /// 全部作业类型，按名称排序
    pub fn list_job_types(&self) -> ManagerResult<Vec<JobTypeInfo>> {
        let mut infos = self
            .job_types
            .values()
            .map(|job_type| Self::info_for(job_type.as_ref()))
            .collect::<ManagerResult<Vec<_>>>()?;
        infos.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        Ok(infos)
    }

    pub fn get_job_type(&self, name: &str) -> ManagerResult<JobTypeInfo> {
        Self::info_for(self.lookup(name)?)
    }

    /// 编译提交的作业
    pub fn compile(&self, submitted: &SubmittedJob) -> ManagerResult<AuthoredJob> {
        let job_type = self.lookup(&submitted.job_type)?;
        let descriptor = job_type.descriptor();
        check_job_type_etag(&descriptor, submitted)?;

        let mut settings = submitted.settings.clone();
        descriptor.apply_to_settings(&mut settings)?;

        let mut job = AuthoredJob::new(
            submitted.name.clone(),
            submitted.job_type.clone(),
            submitted.priority,
            self.clock.now(),
        );
        job.settings = settings;
        job.metadata = submitted.metadata.clone();
        job.storage_shaman_checkout_id = submitted.storage_shaman_checkout_id.clone();
        job.worker_tag_id = submitted.worker_tag_id;

        job_type.compile(&mut job)?;

        if job.tasks().is_empty() {
            return Err(ManagerError::InvalidJobSettings(format!(
                "作业类型 {} 没有为该作业生成任何任务",
                submitted.job_type
            )));
        }

        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            num_tasks = job.tasks().len(),
            "作业编译完成"
        );
        Ok(job)
    }

    fn lookup(&self, name: &str) -> ManagerResult<&dyn JobType> {
        self.job_types
            .get(name)
            .map(|job_type| job_type.as_ref())
            .ok_or_else(|| ManagerError::JobTypeUnknown(name.to_string()))
    }

    fn info_for(job_type: &dyn JobType) -> ManagerResult<JobTypeInfo> {
        let descriptor = job_type.descriptor();
        let etag = descriptor.etag()?;
        Ok(JobTypeInfo { descriptor, etag })
    }
}

/// 提交中带有etag时必须与当前描述的etag一致；未带etag时不检查
fn check_job_type_etag(
    descriptor: &JobTypeDescriptor,
    submitted: &SubmittedJob,
) -> ManagerResult<()> {
    let submitted_etag = match submitted.type_etag.as_deref() {
        None | Some("") => return Ok(()),
        Some(etag) => etag,
    };

    let current = descriptor.etag()?;
    if submitted_etag != current {
        return Err(ManagerError::JobTypeBadEtag {
            job_type: descriptor.name.clone(),
            submitted: submitted_etag.to_string(),
            current,
        });
    }
    Ok(())
}
