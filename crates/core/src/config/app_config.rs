use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    agent::AgentConfig,
    api_observability::{ApiConfig, ObservabilityConfig},
    database::DatabaseConfig,
    engine::EngineConfig,
};

/// 代理完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置
    ///
    /// 加载顺序:
    /// 1. 默认配置
    /// 2. 配置文件 (TOML)
    /// 3. 环境变量覆盖 (前缀 `OBSHELL_`, 层级之间用 `__` 分隔,
    ///    例如 `OBSHELL_AGENT__PORT=2887`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["etc/obshell.toml", "obshell.toml", "/etc/obshell/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("OBSHELL")
                .prefix_separator("_")
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

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.agent.validate().context("代理配置验证失败")?;
        self.database.validate().context("数据库配置验证失败")?;
        self.engine.validate().context("引擎配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.port, 2886);
        assert_eq!(config.engine.maintainer_update_interval_ms, 4_000);
        assert_eq!(config.engine.maintainer_max_active_time_ms, 5_000);
        assert!(config.engine.scheduler_tick_ms <= 1_000);
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let mut config = AppConfig::default();
        config.agent.ip = "10.0.0.8".to_string();
        config.engine.scheduler_tick_ms = 200;

        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.agent.ip, "10.0.0.8");
        assert_eq!(parsed.engine.scheduler_tick_ms, 200);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed = AppConfig::from_toml(
            r#"
            [agent]
            port = 2887
            "#,
        )
        .unwrap();
        assert_eq!(parsed.agent.port, 2887);
        assert_eq!(parsed.agent.ip, "127.0.0.1");
        assert_eq!(parsed.database.max_connections, 10);
    }

    #[test]
    fn test_validation_rejects_slow_tick() {
        let mut config = AppConfig::default();
        config.engine.scheduler_tick_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_heartbeat_longer_than_window() {
        let mut config = AppConfig::default();
        config.engine.maintainer_update_interval_ms = 6_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_ip_and_url() {
        let mut config = AppConfig::default();
        config.agent.ip = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.database.cluster_url = "postgres://localhost/ocs".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [agent]
            ip = "192.168.1.10"
            zone = "zone2"

            [engine]
            scheduler_tick_ms = 100
            "#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.agent.ip, "192.168.1.10");
        assert_eq!(config.agent.zone, "zone2");
        assert_eq!(config.engine.scheduler_tick_ms, 100);
        assert_eq!(config.agent.port, 2886);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/obshell.toml")).is_err());
    }
}
