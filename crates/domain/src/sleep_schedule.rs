//! 睡眠计划的纯计算
//!
//! 所有函数都以本地墙上时间（`NaiveDateTime`）为输入，时区换算由调用方完成。

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};

use renderfarm_core::{SleepSchedule, WorkerStatus};

const DAY_ABBREVIATIONS: [&str; 7] = ["mo", "tu", "we", "th", "fr", "sa", "su"];

/// 星期的两字母缩写
pub fn day_abbreviation(weekday: Weekday) -> &'static str {
    DAY_ABBREVIATIONS[weekday.num_days_from_monday() as usize]
}

/// 规范化星期列表：小写、取前两个字母、去掉无法识别的与重复的，按周一到周日排序
pub fn clean_days_of_week(days: &str) -> String {
    let requested: Vec<String> = days
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|d| !d.is_empty())
        .map(|d| d.to_lowercase().chars().take(2).collect())
        .collect();

    DAY_ABBREVIATIONS
        .iter()
        .filter(|abbrev| requested.iter().any(|d| d == *abbrev))
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// 保存前规范化睡眠计划：清理星期列表，开始时间晚于结束时间时交换两者
pub fn normalize_schedule(schedule: &mut SleepSchedule) {
    schedule.days_of_week = clean_days_of_week(&schedule.days_of_week);

    if let (Some(start), Some(end)) = (schedule.start_time, schedule.end_time) {
        if end < start {
            schedule.start_time = Some(end);
            schedule.end_time = Some(start);
        }
    }
}

fn applies_to_day(schedule: &SleepSchedule, now: NaiveDateTime) -> bool {
    let days = schedule.days_of_week.trim();
    if days.is_empty() {
        return true;
    }
    let today = day_abbreviation(now.weekday());
    days.split_whitespace().any(|d| d == today)
}

/// 按计划此刻Worker应处的状态；没有激活计划的Worker总是应当醒着
pub fn scheduled_worker_status(now: NaiveDateTime, schedule: Option<&SleepSchedule>) -> WorkerStatus {
    let schedule = match schedule {
        Some(schedule) if schedule.is_active => schedule,
        _ => return WorkerStatus::Awake,
    };

    if !applies_to_day(schedule, now) {
        return WorkerStatus::Awake;
    }

    // 没有时间窗口时只看星期
    if schedule.start_time.is_none() && schedule.end_time.is_none() {
        return WorkerStatus::Asleep;
    }

    let time = now.time();
    if let Some(start) = schedule.start_time {
        if time < start {
            return WorkerStatus::Awake;
        }
    }
    if let Some(end) = schedule.end_time {
        if time >= end {
            return WorkerStatus::Awake;
        }
    }
    WorkerStatus::Asleep
}

/// 下一次需要重新评估计划的时间：下一个午夜、下一次开始、下一次结束中最早的一个
pub fn calculate_next_check(now: NaiveDateTime, schedule: &SleepSchedule) -> NaiveDateTime {
    let today = now.date();
    let next_at = |time: NaiveTime| {
        let candidate = today.and_time(time);
        if candidate <= now {
            candidate + Duration::days(1)
        } else {
            candidate
        }
    };

    let mut next = next_at(NaiveTime::default());
    for time in [schedule.start_time, schedule.end_time].into_iter().flatten() {
        next = next.min(next_at(time));
    }
    next
}
