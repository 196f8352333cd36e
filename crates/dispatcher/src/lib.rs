//! 渲染农场调度核心
//!
//! 任务/作业状态机、任务调度器以及后台控制循环（超时检测、睡眠计划、作业删除），
//! 另外提供面向Worker和面向作业管理的服务入口。

pub mod job_deleter;
pub mod job_service;
pub mod sleep_scheduler;
pub mod task_scheduler;
pub mod task_state_machine;
pub mod timeout_checker;
pub mod worker_service;

pub use job_deleter::{JobDeleter, JobDeleterConfig};
pub use job_service::JobService;
pub use sleep_scheduler::{SleepScheduler, SleepSchedulerConfig};
pub use task_scheduler::TaskScheduler;
pub use task_state_machine::{StateMachineConfig, TaskStateMachine, TaskStateMachineService};
pub use timeout_checker::{TimeoutChecker, TimeoutCheckerConfig};
pub use worker_service::{ScheduleOutcome, TaskUpdateRequest, WorkerService};
