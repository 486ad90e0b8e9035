use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    logging::LogConfig,
    scheduler::{ProcessorConfig, RetryConfig, SchedulerConfig},
};
use crate::validation::ConfigValidator;

/// 环境变量前缀，例如 `BATCH__SCHEDULER__DEVICES=0,1`
pub const ENV_PREFIX: &str = "BATCH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub processor: ProcessorConfig,
    pub logging: LogConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/batch.toml", "batch.toml"];

            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
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

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.scheduler.validate()?;
        self.retry.validate()?;
        self.processor.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogLevel, OutputFormat};
    use std::io::Write;

    #[test]
    fn test_app_config_default_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.devices, "auto");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.processor.transient_exit_codes, vec![75]);
    }

    #[test]
    fn test_app_config_from_partial_toml() {
        let toml_str = r#"
[scheduler]
devices = "0,1"
timeout_seconds = 3600

[retry]
max_attempts = 5
initial_delay_ms = 200

[logging]
level = "debug"
format = "json"
"#;

        let config = AppConfig::from_toml(toml_str).expect("Failed to parse");
        assert_eq!(config.scheduler.devices, "0,1");
        assert_eq!(config.scheduler.timeout_seconds, Some(3600));
        assert_eq!(config.scheduler.grace_period_seconds, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, OutputFormat::Json);
    }

    #[test]
    fn test_app_config_rejects_invalid_values() {
        let toml_str = r#"
[retry]
max_attempts = 0
"#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_app_config_toml_round_trip() {
        let mut config = AppConfig::default();
        config.processor.shell_command = "transcribe {input}".to_string();
        let toml_str = config.to_toml().expect("Failed to serialize");
        let parsed = AppConfig::from_toml(&toml_str).expect("Failed to parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_app_config_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("Failed to create temp file");
        writeln!(
            file,
            "[processor]\nshell_command = \"whisper --file {{input}}\"\ntransient_exit_codes = [75, 111]"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).expect("Failed to load");
        assert_eq!(config.processor.shell_command, "whisper --file {input}");
        assert_eq!(config.processor.transient_exit_codes, vec![75, 111]);
    }

    #[test]
    fn test_app_config_load_missing_file() {
        assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
    }
}
