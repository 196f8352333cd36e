//! 配置管理
//!
//! 配置按以下顺序合并，后者覆盖前者：
//!
//! 1. 内置默认值
//! 2. TOML配置文件
//! 3. `RENDERFARM__` 前缀的环境变量（层级用 `__` 分隔，例如
//!    `RENDERFARM__MANAGER__TASK_TIMEOUT_SECONDS=900`）

pub mod models;

pub use models::{AppConfig, DatabaseConfig, LogConfig, ManagerConfig};
