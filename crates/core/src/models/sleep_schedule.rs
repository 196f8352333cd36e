use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Worker的睡眠计划
///
/// # 字段说明
///
/// * `days_of_week` - 空格分隔的星期缩写（"mo tu we th fr sa su"），为空表示每天
/// * `start_time` / `end_time` - 睡眠时间窗口（本地时间），`start_time` 不晚于 `end_time`
/// * `next_check` - 下一次需要重新评估的时间
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SleepSchedule {
    pub worker_id: Uuid,
    pub is_active: bool,
    pub days_of_week: String,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub next_check: Option<DateTime<Utc>>,
}

impl SleepSchedule {
    pub fn new(worker_id: Uuid) -> Self {
        Self {
            worker_id,
            is_active: false,
            days_of_week: String::new(),
            start_time: None,
            end_time: None,
            next_check: None,
        }
    }
}
