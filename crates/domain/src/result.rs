use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::task::{Task, TaskId};

/// 处理器单次成功调用的产出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub audio_duration_seconds: Option<f64>,
    pub output_dir: Option<PathBuf>,
}

/// 每个任务的终态结果，成功或永久失败各发出一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub device_id: DeviceId,
    pub input_path: PathBuf,
    pub input_bytes: u64,
    pub success: bool,
    pub duration_seconds: f64,
    pub audio_duration_seconds: Option<f64>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn succeeded(task: &Task, duration_seconds: f64, output: &ProcessOutput, attempts: u32) -> Self {
        Self {
            task_id: task.id,
            device_id: task.assigned_device,
            input_path: task.input_path.clone(),
            input_bytes: task.size_bytes,
            success: true,
            duration_seconds,
            audio_duration_seconds: output.audio_duration_seconds,
            attempts,
            error: None,
        }
    }

    pub fn failed(task: &Task, duration_seconds: f64, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id,
            device_id: task.assigned_device,
            input_path: task.input_path.clone(),
            input_bytes: task.size_bytes,
            success: false,
            duration_seconds,
            audio_duration_seconds: None,
            attempts,
            error: Some(error.into()),
        }
    }

    /// 单个结果的实时率，缺少音频时长时为 None
    pub fn rtf(&self) -> Option<f64> {
        match self.audio_duration_seconds {
            Some(audio) if audio > 0.0 => Some(self.duration_seconds / audio),
            _ => None,
        }
    }

    pub fn file_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input_path.display().to_string())
    }
}
