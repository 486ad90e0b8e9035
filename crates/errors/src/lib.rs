use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("设备不可用: {requested:?}，可用设备: {available:?}")]
    DeviceUnavailable {
        requested: Vec<String>,
        available: Vec<String>,
    },
    #[error("无效的设备描述: {0}")]
    InvalidDeviceSpec(String),
    #[error("未检测到可用设备")]
    NoDevicesDetected,
    #[error("输入目录不存在: {0}")]
    InputNotFound(PathBuf),
    #[error("路径不是目录: {0}")]
    NotADirectory(PathBuf),
    #[error("未找到匹配文件: {root} ({pattern})")]
    NoFilesFound { root: PathBuf, pattern: String },
    #[error("无效的文件匹配模式: {pattern} - {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("清单文件错误: {0}")]
    Manifest(String),
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("启动Worker进程失败: 设备 {device} - {message}")]
    WorkerSpawn { device: String, message: String },
    #[error("Worker通信协议错误: {0}")]
    WorkerProtocol(String),
    #[error("临时错误: {0}")]
    Transient(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("Worker进程异常退出: 设备 {device}, 退出码 {exit_code:?}")]
    WorkerCrash {
        device: String,
        exit_code: Option<i32>,
    },
    #[error("任务已取消: {0}")]
    Cancelled(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type BatchResult<T> = Result<T, BatchError>;

impl BatchError {
    pub fn device_unavailable<S: ToString>(requested: &[S], available: &[S]) -> Self {
        Self::DeviceUnavailable {
            requested: requested.iter().map(ToString::to_string).collect(),
            available: available.iter().map(ToString::to_string).collect(),
        }
    }
    pub fn invalid_device_spec<S: Into<String>>(msg: S) -> Self {
        Self::InvalidDeviceSpec(msg.into())
    }
    pub fn no_files_found<P: Into<PathBuf>, S: Into<String>>(root: P, pattern: S) -> Self {
        Self::NoFilesFound {
            root: root.into(),
            pattern: pattern.into(),
        }
    }
    pub fn manifest_error<S: Into<String>>(msg: S) -> Self {
        Self::Manifest(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }
    pub fn task_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::WorkerProtocol(msg.into())
    }
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// 启动前的致命错误，出现时不会启动任何Worker
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            BatchError::DeviceUnavailable { .. }
                | BatchError::InvalidDeviceSpec(_)
                | BatchError::NoDevicesDetected
                | BatchError::InputNotFound(_)
                | BatchError::NotADirectory(_)
                | BatchError::NoFilesFound { .. }
                | BatchError::InvalidPattern { .. }
                | BatchError::Configuration(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchError::Transient(_) | BatchError::Timeout(_))
    }
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BatchError::Cancelled(_))
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        BatchError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for BatchError {
    fn from(err: anyhow::Error) -> Self {
        BatchError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
