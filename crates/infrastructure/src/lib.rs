pub mod broadcaster;
pub mod database;
pub mod observability;
pub mod task_log;

pub use broadcaster::ChannelBroadcaster;
pub use database::*;
pub use observability::*;
pub use task_log::TracingTaskLogSink;
