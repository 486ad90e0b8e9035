use std::time::Duration;

use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// "auto" 或逗号分隔的设备列表
    pub devices: String,
    pub pattern: String,
    pub timeout_seconds: Option<u64>,
    pub grace_period_seconds: u64,
    pub manifest_file_name: String,
    pub incremental_manifest: bool,
    /// 用于探测GPU的程序
    pub nvidia_smi_program: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            devices: "auto".to_string(),
            pattern: "*.wav".to_string(),
            timeout_seconds: None,
            grace_period_seconds: 10,
            manifest_file_name: "batch_manifest.json".to_string(),
            incremental_manifest: true,
            nvidia_smi_program: "nvidia-smi".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.devices, "scheduler.devices")?;
        ValidationUtils::validate_not_empty(&self.pattern, "scheduler.pattern")?;
        ValidationUtils::validate_not_empty(
            &self.manifest_file_name,
            "scheduler.manifest_file_name",
        )?;
        if let Some(timeout) = self.timeout_seconds {
            ValidationUtils::validate_timeout_seconds(timeout, "scheduler.timeout_seconds")?;
        }
        ValidationUtils::validate_timeout_seconds(
            self.grace_period_seconds,
            "scheduler.grace_period_seconds",
        )?;
        ValidationUtils::validate_not_empty(
            &self.nvidia_smi_program,
            "scheduler.nvidia_smi_program",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.max_attempts as u64, "retry.max_attempts", 100)?;
        if self.backoff_multiplier < 1.0 {
            return Err(crate::ConfigError::Validation(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(crate::ConfigError::Validation(
                "retry.initial_delay_ms cannot exceed retry.max_delay_ms".to_string(),
            ));
        }
        ValidationUtils::validate_ratio(self.jitter_factor, "retry.jitter_factor")?;
        Ok(())
    }
}

/// 外部处理命令配置，命令通过 shell 执行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    pub shell_command: String,
    pub transient_exit_codes: Vec<i32>,
    pub timeout_seconds: Option<u64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            shell_command: String::new(),
            // EX_TEMPFAIL
            transient_exit_codes: vec![75],
            timeout_seconds: None,
        }
    }
}

impl ProcessorConfig {
    pub fn is_configured(&self) -> bool {
        !self.shell_command.trim().is_empty()
    }
}

impl ConfigValidator for ProcessorConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.transient_exit_codes.contains(&0) {
            return Err(crate::ConfigError::Validation(
                "processor.transient_exit_codes cannot contain 0".to_string(),
            ));
        }
        if let Some(timeout) = self.timeout_seconds {
            ValidationUtils::validate_timeout_seconds(timeout, "processor.timeout_seconds")?;
        }
        Ok(())
    }
}
