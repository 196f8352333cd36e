//! 数据库行映射的公共工具
//!
//! SQLite中UUID、时间与JSON字段都以TEXT保存。时间统一格式化为
//! 定长的RFC3339微秒UTC字符串，按字符串比较即按时间先后比较。

use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use renderfarm_core::{ManagerError, ManagerResult};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn format_time(time: DateTime<Utc>) -> String {
        time.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn format_opt_time(time: Option<DateTime<Utc>>) -> Option<String> {
        time.map(Self::format_time)
    }

    pub fn format_naive_time(time: Option<NaiveTime>) -> Option<String> {
        time.map(|t| t.format("%H:%M:%S").to_string())
    }

    pub fn parse_uuid(row: &SqliteRow, field: &str) -> ManagerResult<Uuid> {
        let text: String = row.try_get(field).map_err(ManagerError::from_db)?;
        Self::uuid_from_str(&text, field)
    }

    pub fn parse_opt_uuid(row: &SqliteRow, field: &str) -> ManagerResult<Option<Uuid>> {
        let text: Option<String> = row.try_get(field).map_err(ManagerError::from_db)?;
        text.map(|t| Self::uuid_from_str(&t, field)).transpose()
    }

    pub fn parse_time(row: &SqliteRow, field: &str) -> ManagerResult<DateTime<Utc>> {
        let text: String = row.try_get(field).map_err(ManagerError::from_db)?;
        Self::time_from_str(&text, field)
    }

    pub fn parse_opt_time(row: &SqliteRow, field: &str) -> ManagerResult<Option<DateTime<Utc>>> {
        let text: Option<String> = row.try_get(field).map_err(ManagerError::from_db)?;
        text.map(|t| Self::time_from_str(&t, field)).transpose()
    }

    /// 接受 `HH:MM` 与 `HH:MM:SS` 两种格式
    pub fn parse_naive_time(row: &SqliteRow, field: &str) -> ManagerResult<Option<NaiveTime>> {
        let text: Option<String> = row.try_get(field).map_err(ManagerError::from_db)?;
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        NaiveTime::parse_from_str(&text, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M"))
            .map(Some)
            .map_err(|e| ManagerError::Serialization(format!("解析字段 {field} 的时间失败: {e}")))
    }

    pub fn parse_json<T: DeserializeOwned + Default>(
        row: &SqliteRow,
        field: &str,
    ) -> ManagerResult<T> {
        let text: Option<String> = row.try_get(field).map_err(ManagerError::from_db)?;
        match text.filter(|t| !t.is_empty()) {
            Some(text) => serde_json::from_str(&text).map_err(|e| {
                ManagerError::Serialization(format!("解析字段 {field} 的JSON失败: {e}"))
            }),
            None => Ok(T::default()),
        }
    }

    /// 生成 `?N, ?N+1, ...` 形式的占位符，`first` 从1开始计数
    pub fn placeholders(first: usize, count: usize) -> String {
        (first..first + count)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn uuid_from_str(text: &str, field: &str) -> ManagerResult<Uuid> {
        Uuid::parse_str(text)
            .map_err(|e| ManagerError::Serialization(format!("解析字段 {field} 的UUID失败: {e}")))
    }

    fn time_from_str(text: &str, field: &str) -> ManagerResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ManagerError::Serialization(format!("解析字段 {field} 的时间失败: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_formatted_times_sort_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 6, 5, 10, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        let c = a + chrono::Duration::seconds(9);
        let formatted: Vec<String> = [a, b, c].into_iter().map(MappingHelpers::format_time).collect();

        let mut sorted = formatted.clone();
        sorted.sort();
        assert_eq!(sorted, formatted);
        assert_eq!(formatted[0], "2024-06-05T10:00:00.000000Z");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(MappingHelpers::placeholders(2, 3), "?2, ?3, ?4");
        assert_eq!(MappingHelpers::placeholders(1, 0), "");
    }
}
