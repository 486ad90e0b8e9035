use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;

use batch_domain::{Device, DeviceId, DeviceInfo};
use batch_errors::{BatchError, BatchResult};
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;

/// 设备探测接口
pub trait DeviceProbe: Send + Sync {
    /// 返回本机可用的加速器，没有时返回空列表
    fn probe(&self) -> BatchResult<Vec<DeviceInfo>>;

    fn name(&self) -> &str;
}

/// 通过 `nvidia-smi` 查询GPU
pub struct NvidiaSmiProbe {
    program: PathBuf,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            program: PathBuf::from("nvidia-smi"),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn query(&self, fields: &str) -> Option<String> {
        let output = Command::new(&self.program)
            .arg(format!("--query-gpu={fields}"))
            .arg("--format=csv,noheader,nounits")
            .output();

        match output {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                debug!(
                    "nvidia-smi 查询失败 (fields={}): {}",
                    fields,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                debug!("无法执行 {}: {}", self.program.display(), e);
                None
            }
        }
    }
}

impl DeviceProbe for NvidiaSmiProbe {
    fn probe(&self) -> BatchResult<Vec<DeviceInfo>> {
        // 旧版驱动不支持 compute_cap 字段
        let text = self
            .query("index,name,memory.total,compute_cap")
            .or_else(|| self.query("index,name,memory.total"));
        Ok(text.map(|t| parse_nvidia_smi_csv(&t)).unwrap_or_default())
    }

    fn name(&self) -> &str {
        "nvidia-smi"
    }
}

/// 解析 `nvidia-smi --format=csv,noheader,nounits` 的输出
pub fn parse_nvidia_smi_csv(text: &str) -> Vec<DeviceInfo> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let index = fields.first()?.parse::<u32>().ok()?;
            let name = fields
                .get(1)
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string());
            let total_memory = fields
                .get(2)
                .and_then(|mib| mib.parse::<u64>().ok())
                .map(|mib| mib * MIB);
            let compute_capability = fields.get(3).and_then(|cap| {
                let (major, minor) = cap.split_once('.')?;
                Some((major.parse().ok()?, minor.parse().ok()?))
            });
            Some(DeviceInfo {
                id: Some(DeviceId::Gpu(index)),
                name,
                total_memory,
                compute_capability,
            })
        })
        .collect()
}

/// 固定设备列表
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    devices: Vec<DeviceInfo>,
}

impl StaticProbe {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }

    /// 指定数量的GPU，名称与显存为假定值
    pub fn gpus(count: u32) -> Self {
        Self::new(
            (0..count)
                .map(|index| DeviceInfo {
                    id: Some(DeviceId::Gpu(index)),
                    name: Some(format!("Static GPU {index}")),
                    total_memory: Some(16 * 1024 * MIB),
                    compute_capability: None,
                })
                .collect(),
        )
    }
}

impl DeviceProbe for StaticProbe {
    fn probe(&self) -> BatchResult<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

pub struct DeviceDetector {
    probe: Box<dyn DeviceProbe>,
    detected: OnceLock<Vec<DeviceInfo>>,
}

impl Default for DeviceDetector {
    fn default() -> Self {
        Self::new(Box::new(NvidiaSmiProbe::default()))
    }
}

impl DeviceDetector {
    pub fn new(probe: Box<dyn DeviceProbe>) -> Self {
        Self {
            probe,
            detected: OnceLock::new(),
        }
    }

    fn accelerators(&self) -> &[DeviceInfo] {
        self.detected.get_or_init(|| match self.probe.probe() {
            Ok(devices) => {
                info!(probe = self.probe.name(), "检测到 {} 个加速器", devices.len());
                devices
            }
            Err(e) => {
                warn!(probe = self.probe.name(), "设备探测失败，按无加速器处理: {}", e);
                Vec::new()
            }
        })
    }

    pub fn is_accelerator_available(&self) -> bool {
        !self.accelerators().is_empty()
    }

    /// 所有可用设备；没有加速器时返回单个CPU伪设备
    pub fn list_devices(&self) -> Vec<Device> {
        let accelerators = self.accelerators();
        if accelerators.is_empty() {
            return vec![Device::cpu()];
        }
        accelerators
            .iter()
            .filter_map(|info| {
                info.id.map(|id| Device {
                    id,
                    display_name: info.name.clone(),
                    total_memory: info.total_memory,
                })
            })
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.list_devices().len()
    }

    pub fn available_ids(&self) -> Vec<DeviceId> {
        self.list_devices().into_iter().map(|d| d.id).collect()
    }

    /// 校验请求的设备均可用
    pub fn validate(&self, requested: &[DeviceId]) -> BatchResult<()> {
        if requested.is_empty() {
            return Err(BatchError::invalid_device_spec("未指定任何设备"));
        }

        let available = self.available_ids();
        let missing: Vec<DeviceId> = requested
            .iter()
            .filter(|id| !available.contains(id))
            .copied()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BatchError::device_unavailable(&missing, &available))
        }
    }

    /// 解析设备描述："auto" 或逗号分隔的设备列表
    pub fn parse_spec(&self, spec: &str) -> BatchResult<Vec<DeviceId>> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("auto") {
            let ids = self.available_ids();
            info!("自动选择设备: {:?}", ids);
            return Ok(ids);
        }
        if spec.is_empty() {
            return Err(BatchError::invalid_device_spec("设备描述为空"));
        }

        let ids = spec
            .split(',')
            .map(str::parse::<DeviceId>)
            .collect::<BatchResult<Vec<_>>>()?;

        let mut seen = HashSet::new();
        if let Some(duplicate) = ids.iter().find(|id| !seen.insert(**id)) {
            return Err(BatchError::invalid_device_spec(format!(
                "设备 {duplicate} 被重复指定"
            )));
        }
        Ok(ids)
    }

    /// 尽力返回设备信息，无法获取的字段为 `None`
    pub fn describe(&self, id: DeviceId) -> DeviceInfo {
        if id.is_cpu() {
            return DeviceInfo {
                id: Some(id),
                name: Some("CPU".to_string()),
                ..Default::default()
            };
        }
        self.accelerators()
            .iter()
            .find(|info| info.id == Some(id))
            .cloned()
            .unwrap_or_else(|| DeviceInfo::unknown(id))
    }
}
