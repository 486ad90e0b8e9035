use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceId;
use crate::result::TaskResult;
use crate::task::{Task, TaskState};

/// 清单中的单个任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub input_path: PathBuf,
    pub assigned_device: DeviceId,
    pub status: TaskState,
    pub error: Option<String>,
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub attempts: u32,
}

impl ManifestEntry {
    pub fn from_task(task: &Task) -> Self {
        Self {
            input_path: task.input_path.clone(),
            assigned_device: task.assigned_device,
            status: task.state,
            error: task.last_error.clone(),
            duration_seconds: None,
            attempts: task.attempt_count,
        }
    }

    pub fn from_result(result: &TaskResult) -> Self {
        Self {
            input_path: result.input_path.clone(),
            assigned_device: result.device_id,
            status: if result.success {
                TaskState::Succeeded
            } else {
                TaskState::Failed
            },
            error: result.error.clone(),
            duration_seconds: Some(result.duration_seconds),
            attempts: result.attempts,
        }
    }
}

/// 批处理清单，用于断点续跑
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub run_id: Uuid,
    pub host: Option<String>,
    pub root: PathBuf,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

impl BatchManifest {
    pub fn new(root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            host: None,
            root: root.into(),
            pattern: pattern.into(),
            created_at: now,
            updated_at: now,
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, path: &Path) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.input_path == path)
    }

    pub fn is_succeeded(&self, path: &Path) -> bool {
        self.entry(path)
            .is_some_and(|e| e.status == TaskState::Succeeded)
    }

    pub fn succeeded_paths(&self) -> HashSet<PathBuf> {
        self.entries
            .iter()
            .filter(|e| e.status == TaskState::Succeeded)
            .map(|e| e.input_path.clone())
            .collect()
    }

    /// 按输入路径插入或替换记录
    pub fn upsert(&mut self, entry: ManifestEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.input_path == entry.input_path)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.updated_at = Utc::now();
    }

    pub fn count(&self, status: TaskState) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, status: TaskState) -> ManifestEntry {
        ManifestEntry {
            input_path: PathBuf::from(path),
            assigned_device: DeviceId::Gpu(0),
            status,
            error: None,
            duration_seconds: None,
            attempts: 0,
        }
    }

    #[test]
    fn test_upsert_replaces_by_path() {
        let mut manifest = BatchManifest::new("/in", "*.wav");
        manifest.upsert(entry("/in/a.wav", TaskState::Failed));
        manifest.upsert(entry("/in/b.wav", TaskState::Pending));
        manifest.upsert(entry("/in/a.wav", TaskState::Succeeded));

        assert_eq!(manifest.entries.len(), 2);
        assert!(manifest.is_succeeded(Path::new("/in/a.wav")));
        assert!(!manifest.is_succeeded(Path::new("/in/b.wav")));
        assert_eq!(manifest.count(TaskState::Pending), 1);
    }

    #[test]
    fn test_succeeded_paths() {
        let mut manifest = BatchManifest::new("/in", "*.wav");
        manifest.upsert(entry("/in/a.wav", TaskState::Succeeded));
        manifest.upsert(entry("/in/b.wav", TaskState::Failed));
        manifest.upsert(entry("/in/c.wav", TaskState::Succeeded));

        let done = manifest.succeeded_paths();
        assert_eq!(done.len(), 2);
        assert!(done.contains(Path::new("/in/c.wav")));
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut manifest = BatchManifest::new("/in", "*.wav");
        manifest.upsert(entry("/in/a.wav", TaskState::Succeeded));
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["entries"][0]["status"], "succeeded");
        assert_eq!(json["entries"][0]["assigned_device"], "0");
    }
}
