use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{database::DatabaseConfig, log::LogConfig, manager::ManagerConfig};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub manager: ManagerConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: RENDERFARM__)
    ///
    /// # Arguments
    ///
    /// * `config_path` - Config file path, if None use default paths
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = AppConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("database.url", defaults.database.url.as_str())?
            .set_default(
                "database.max_connections",
                i64::from(defaults.database.max_connections),
            )?
            .set_default(
                "database.min_connections",
                i64::from(defaults.database.min_connections),
            )?
            .set_default(
                "database.connection_timeout_seconds",
                defaults.database.connection_timeout_seconds as i64,
            )?
            .set_default(
                "database.integrity_check_interval_seconds",
                defaults.database.integrity_check_interval_seconds as i64,
            )?
            .set_default(
                "manager.task_timeout_seconds",
                defaults.manager.task_timeout_seconds as i64,
            )?
            .set_default(
                "manager.worker_timeout_seconds",
                defaults.manager.worker_timeout_seconds as i64,
            )?
            .set_default(
                "manager.blocklist_threshold",
                i64::from(defaults.manager.blocklist_threshold),
            )?
            .set_default(
                "manager.task_fail_after_softfail_count",
                i64::from(defaults.manager.task_fail_after_softfail_count),
            )?
            .set_default(
                "manager.timeout_check_initial_delay_seconds",
                defaults.manager.timeout_check_initial_delay_seconds as i64,
            )?
            .set_default(
                "manager.timeout_check_interval_seconds",
                defaults.manager.timeout_check_interval_seconds as i64,
            )?
            .set_default(
                "manager.sleep_check_initial_delay_seconds",
                defaults.manager.sleep_check_initial_delay_seconds as i64,
            )?
            .set_default(
                "manager.sleep_check_interval_seconds",
                defaults.manager.sleep_check_interval_seconds as i64,
            )?
            .set_default(
                "manager.job_deletion_queue_size",
                defaults.manager.job_deletion_queue_size as i64,
            )?
            .set_default(
                "manager.job_deletion_recheck_interval_seconds",
                defaults.manager.job_deletion_recheck_interval_seconds as i64,
            )?
            .set_default("log.level", defaults.log.level.as_str())?
            .set_default("log.format", defaults.log.format.as_str())?;

        // 1. Load config file if provided
        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["renderfarm.toml", "config/renderfarm.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        // 2. Environment variable overrides - highest priority
        builder = builder.add_source(
            Environment::with_prefix("RENDERFARM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.manager.validate().context("管理器配置验证失败")?;
        self.log.validate().context("日志配置验证失败")?;
        Ok(())
    }
}
