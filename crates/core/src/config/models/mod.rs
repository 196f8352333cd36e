pub mod app_config;
pub mod database;
pub mod log;
pub mod manager;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use log::LogConfig;
pub use manager::ManagerConfig;
