use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// 单个设备的累计统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub files_done: u64,
    pub failed: u64,
    pub time_spent: f64,
    pub bytes_processed: u64,
    pub audio_seconds: f64,
}

impl DeviceStats {
    pub fn files_total(&self) -> u64 {
        self.files_done + self.failed
    }

    pub fn rtf(&self) -> f64 {
        if self.audio_seconds > 0.0 {
            self.time_spent / self.audio_seconds
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub per_device: BTreeMap<DeviceId, DeviceStats>,
    pub rtf: f64,
    pub speedup: f64,
    pub wall_time_seconds: f64,
}

impl MetricsSnapshot {
    pub fn files_done(&self) -> u64 {
        self.per_device.values().map(|s| s.files_done).sum()
    }

    pub fn failed(&self) -> u64 {
        self.per_device.values().map(|s| s.failed).sum()
    }
}
