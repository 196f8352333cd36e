pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod traits;

pub use config::{AppConfig, DatabaseConfig, LogConfig, ManagerConfig};
pub use errors::*;
pub use events::*;
pub use models::{
    Command, Job, JobBlock, JobStatus, SleepSchedule, Task, TaskFailure, TaskStatus, Worker,
    WorkerStatus, WorkerTag,
};
pub use traits::*;
