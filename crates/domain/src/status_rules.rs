//! 状态转换规则与作业状态推导
//!
//! 所有转换都是显式列出的，没有隐式的默认边。相同状态之间的"转换"
//! 视为无操作，由调用方决定是否跳过。

use std::collections::HashMap;

use renderfarm_core::{JobStatus, TaskStatus};

/// 失败任务占比达到该百分比时作业判定为失败
pub const TASK_FAIL_JOB_PERCENTAGE: i64 = 10;

/// 任务状态转换是否合法
pub fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    if from == to {
        return true;
    }
    match from {
        Queued => matches!(to, Active | Paused | CancelRequested | Canceled | Failed),
        Active => matches!(
            to,
            Completed | Failed | SoftFailed | Canceled | CancelRequested | Queued | Paused
        ),
        SoftFailed => matches!(to, Active | Queued | Failed | Canceled | CancelRequested | Paused),
        CancelRequested => matches!(to, Canceled | Completed | Failed | SoftFailed | Queued),
        Paused => matches!(to, Queued | Canceled | CancelRequested),
        Failed => matches!(to, Queued | Canceled),
        Canceled => matches!(to, Queued),
        Completed => matches!(to, Queued),
    }
}

/// 作业状态转换是否合法
pub fn job_transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;

    if from == to {
        return true;
    }
    match from {
        UnderConstruction => matches!(to, Queued | ConstructionFailed),
        ConstructionFailed => false,
        Queued => matches!(
            to,
            Active | Paused | CancelRequested | Canceled | Completed | Failed | Requeueing
        ),
        Active => matches!(
            to,
            Queued | Paused | CancelRequested | Canceled | Completed | Failed | Requeueing
        ),
        Paused => matches!(to, Queued | Active | CancelRequested | Canceled | Requeueing | Completed),
        CancelRequested => matches!(to, Canceled | Failed | Completed),
        Canceled => matches!(to, Queued | Requeueing),
        Failed => matches!(to, Queued | Active | Requeueing | CancelRequested | Canceled),
        Completed => matches!(to, Queued | Active | Requeueing),
        Requeueing => matches!(to, Queued | CancelRequested | Canceled | Failed),
    }
}

/// 根据当前作业状态和任务状态统计推导作业状态
///
/// 这是一个纯函数：对同一组数据重复推导得到相同结果，并且把结果作为
/// `current` 再推导一次不会再改变。
pub fn derive_job_status(current: JobStatus, counts: &HashMap<TaskStatus, i64>) -> JobStatus {
    let count = |status: TaskStatus| counts.get(&status).copied().unwrap_or(0);
    let total: i64 = counts.values().sum();

    // 管理员操作或构建中的状态由显式操作推进，不由任务推导
    match current {
        JobStatus::UnderConstruction
        | JobStatus::ConstructionFailed
        | JobStatus::Requeueing
        | JobStatus::Canceled => return current,
        _ => {}
    }
    if total == 0 {
        return current;
    }

    let completed = count(TaskStatus::Completed);
    if completed == total {
        return JobStatus::Completed;
    }

    if current == JobStatus::CancelRequested {
        let still_running = count(TaskStatus::Active) + count(TaskStatus::CancelRequested);
        return if still_running == 0 {
            JobStatus::Canceled
        } else {
            JobStatus::CancelRequested
        };
    }
    if current == JobStatus::Paused {
        return current;
    }

    let failed = count(TaskStatus::Failed);
    if failed > 0 && failed * 100 >= total * TASK_FAIL_JOB_PERCENTAGE {
        return JobStatus::Failed;
    }

    let in_progress = count(TaskStatus::Active)
        + completed
        + failed
        + count(TaskStatus::SoftFailed);
    if in_progress > 0 {
        return JobStatus::Active;
    }

    match current {
        JobStatus::Active => JobStatus::Active,
        _ => JobStatus::Queued,
    }
}
