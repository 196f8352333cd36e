use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderfarm_core::{ManagerError, ManagerResult, SleepSchedule, SleepScheduleRepository};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

const SCHEDULE_COLUMNS: &str = "worker_id, is_active, days_of_week, start_time, end_time, next_check";

pub struct SqliteSleepScheduleRepository {
    pool: SqlitePool,
}

impl SqliteSleepScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &SqliteRow) -> ManagerResult<SleepSchedule> {
        Ok(SleepSchedule {
            worker_id: MappingHelpers::parse_uuid(row, "worker_id")?,
            is_active: row.try_get("is_active").map_err(ManagerError::from_db)?,
            days_of_week: row.try_get("days_of_week").map_err(ManagerError::from_db)?,
            start_time: MappingHelpers::parse_naive_time(row, "start_time")?,
            end_time: MappingHelpers::parse_naive_time(row, "end_time")?,
            next_check: MappingHelpers::parse_opt_time(row, "next_check")?,
        })
    }
}

#[async_trait]
impl SleepScheduleRepository for SqliteSleepScheduleRepository {
    async fn fetch_sleep_schedule(
        &self,
        worker_id: Uuid,
    ) -> ManagerResult<Option<SleepSchedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM sleep_schedules WHERE worker_id = ?1"
        ))
        .bind(worker_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        row.as_ref().map(Self::row_to_schedule).transpose()
    }

    async fn save_sleep_schedule(&self, schedule: &SleepSchedule) -> ManagerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO sleep_schedules ({SCHEDULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(worker_id) DO UPDATE SET is_active = excluded.is_active, \
             days_of_week = excluded.days_of_week, start_time = excluded.start_time, \
             end_time = excluded.end_time, next_check = excluded.next_check"
        ))
        .bind(schedule.worker_id.to_string())
        .bind(schedule.is_active)
        .bind(&schedule.days_of_week)
        .bind(MappingHelpers::format_naive_time(schedule.start_time))
        .bind(MappingHelpers::format_naive_time(schedule.end_time))
        .bind(MappingHelpers::format_opt_time(schedule.next_check))
        .execute(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        Ok(())
    }

    async fn save_sleep_schedule_next_check(
        &self,
        schedule: &SleepSchedule,
    ) -> ManagerResult<()> {
        sqlx::query("UPDATE sleep_schedules SET next_check = ?1 WHERE worker_id = ?2")
            .bind(MappingHelpers::format_opt_time(schedule.next_check))
            .bind(schedule.worker_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(ManagerError::from_db)?;
        Ok(())
    }

    async fn fetch_sleep_schedules_to_check(
        &self,
        now: DateTime<Utc>,
    ) -> ManagerResult<Vec<SleepSchedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM sleep_schedules \
             WHERE is_active = 1 AND (next_check IS NULL OR next_check <= ?1) \
             ORDER BY rowid"
        ))
        .bind(MappingHelpers::format_time(now))
        .fetch_all(&self.pool)
        .await
        .map_err(ManagerError::from_db)?;
        rows.iter().map(Self::row_to_schedule).collect()
    }
}
