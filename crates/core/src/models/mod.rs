/// 为以字符串形式存储的状态枚举实现SQLite编解码
///
/// 被包装的类型需要提供 `as_str()` 与 `FromStr<Err = String>`。
/// 宏必须定义在子模块声明之前，子模块通过文本作用域直接调用。
macro_rules! sqlite_text_enum {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Sqlite> for $ty {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                s.parse::<$ty>().map_err(Into::into)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut <sqlx::Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode(self.as_str(), buf)
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub mod job;
pub mod sleep_schedule;
pub mod task;
pub mod task_failure;
pub mod worker;

pub use job::{Job, JobStatus};
pub use sleep_schedule::SleepSchedule;
pub use task::{Command, Task, TaskStatus};
pub use task_failure::{JobBlock, TaskFailure};
pub use worker::{Worker, WorkerStatus, WorkerTag};
