use std::fmt;
use std::str::FromStr;

use batch_errors::BatchError;
use serde::{Deserialize, Serialize};

/// 设备标识，GPU按序号区分，无加速器时使用CPU伪设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DeviceId {
    Gpu(u32),
    Cpu,
}

impl DeviceId {
    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceId::Cpu)
    }

    /// 子进程中 `CUDA_VISIBLE_DEVICES` 的取值，CPU设备隐藏全部GPU
    pub fn visible_devices_env(&self) -> String {
        match self {
            DeviceId::Gpu(index) => index.to_string(),
            DeviceId::Cpu => String::new(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Gpu(index) => write!(f, "{index}"),
            DeviceId::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for DeviceId {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("cpu") {
            return Ok(DeviceId::Cpu);
        }
        trimmed.parse::<u32>().map(DeviceId::Gpu).map_err(|_| {
            BatchError::invalid_device_spec(format!(
                "无法解析设备 '{trimmed}'，请使用逗号分隔的整数 (如 '0,1,2')、'cpu' 或 'auto'"
            ))
        })
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for DeviceId {
    type Error = BatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// 检测阶段创建的设备，运行期间不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub display_name: Option<String>,
    pub total_memory: Option<u64>,
}

impl Device {
    pub fn gpu(index: u32, name: impl Into<String>, total_memory: u64) -> Self {
        Self {
            id: DeviceId::Gpu(index),
            display_name: Some(name.into()),
            total_memory: Some(total_memory),
        }
    }

    pub fn cpu() -> Self {
        Self {
            id: DeviceId::Cpu,
            display_name: Some("CPU".to_string()),
            total_memory: None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.display_name) {
            (DeviceId::Cpu, _) => write!(f, "CPU")?,
            (DeviceId::Gpu(index), Some(name)) => write!(f, "GPU {index}: {name}")?,
            (DeviceId::Gpu(index), None) => write!(f, "GPU {index}")?,
        }
        if let Some(bytes) = self.total_memory {
            write!(f, " ({:.2}GB)", bytes as f64 / (1024.0 * 1024.0 * 1024.0))?;
        }
        Ok(())
    }
}

/// 设备详细信息，字段尽力获取，缺失时为 `None`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: Option<DeviceId>,
    pub name: Option<String>,
    pub total_memory: Option<u64>,
    pub compute_capability: Option<(u32, u32)>,
}

impl DeviceInfo {
    pub fn unknown(id: DeviceId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }
}
