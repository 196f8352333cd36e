pub mod collaborators;
pub mod repository;

pub use collaborators::{ChangeBroadcaster, Clock, SystemClock, TaskLogSink};
pub use repository::{
    BlocklistRepository, JobRepository, Repositories, SleepScheduleRepository, TaskRepository,
    WorkerRepository, WorkerTagRepository,
};
