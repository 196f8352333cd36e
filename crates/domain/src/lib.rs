//! 渲染农场的纯领域逻辑：作业编译、状态转换规则、睡眠计划计算。
//!
//! 本crate不访问存储，所有函数都是确定性的，方便在调度服务和测试中复用。

pub mod job_compiler;
pub mod sleep_schedule;
pub mod status_rules;

pub use job_compiler::{
    AuthoredJob, AuthoredTask, JobCompiler, JobType, JobTypeDescriptor, JobTypeInfo,
    SettingDescriptor, SettingType, SubmittedJob, TaskIndex,
};
pub use status_rules::{derive_job_status, job_transition_allowed, task_transition_allowed};
