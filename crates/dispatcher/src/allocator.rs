use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use batch_domain::{BatchManifest, DeviceId, Task};
use batch_errors::{BatchError, BatchResult};
use batch_worker::TaskQueue;
use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 待处理的输入文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }
}

/// 设备到文件列表的静态分配
pub type Partition = BTreeMap<DeviceId, Vec<InputFile>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkloadEstimate {
    pub count: usize,
    pub total_bytes: u64,
    pub avg_bytes: f64,
    pub min_bytes: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DistributionStats {
    pub device_count: usize,
    pub files_per_device: BTreeMap<DeviceId, usize>,
    pub bytes_per_device: BTreeMap<DeviceId, u64>,
    pub avg_files_per_device: f64,
    pub avg_bytes_per_device: f64,
}

/// 构建好的本次运行队列
#[derive(Debug)]
pub struct WorkPlan {
    pub queue: TaskQueue,
    /// 本次提交的任务（不含清单中已成功的文件）
    pub tasks: Vec<Task>,
    /// 因清单中已成功而跳过的文件数
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WorkloadAllocator;

impl WorkloadAllocator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_input_dir(&self, root: &Path) -> BatchResult<()> {
        if !root.exists() {
            return Err(BatchError::InputNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(BatchError::NotADirectory(root.to_path_buf()));
        }
        Ok(())
    }

    /// 递归查找匹配的文件，按路径排序
    ///
    /// 不含 `/` 的模式匹配任意深度的文件名，否则匹配相对 `root` 的路径。
    pub fn discover(&self, root: &Path, pattern: &str) -> BatchResult<Vec<InputFile>> {
        self.validate_input_dir(root)?;
        let matcher = FileMatcher::new(pattern)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("跳过无法访问的路径: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if !matcher.is_match(relative) {
                continue;
            }
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push(InputFile::new(entry.into_path(), size_bytes));
        }

        if files.is_empty() {
            return Err(BatchError::no_files_found(root, pattern));
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            root = %root.display(),
            pattern,
            "发现 {} 个待处理文件",
            files.len()
        );
        Ok(files)
    }

    /// 按大小降序排序后轮询分配到各设备
    pub fn partition(&self, files: &[InputFile], devices: &[DeviceId]) -> Partition {
        let mut partition: Partition = devices.iter().map(|d| (*d, Vec::new())).collect();
        if devices.is_empty() {
            return partition;
        }

        let mut sorted = files.to_vec();
        sorted.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));

        for (i, file) in sorted.into_iter().enumerate() {
            let device = devices[i % devices.len()];
            partition.entry(device).or_default().push(file);
        }

        for (device, files) in &partition {
            debug!(device = %device, "设备 {} 分配到 {} 个文件", device, files.len());
        }
        partition
    }

    /// 按分配顺序生成任务并入队，末尾为每个设备追加一个哨兵
    ///
    /// 清单中已成功的文件不会再次入队。
    pub fn build_queue(
        &self,
        partition: &Partition,
        manifest: Option<&BatchManifest>,
    ) -> BatchResult<WorkPlan> {
        let devices: Vec<DeviceId> = partition.keys().copied().collect();
        let queue = TaskQueue::new(&devices);
        let succeeded = manifest.map(BatchManifest::succeeded_paths).unwrap_or_default();

        let mut tasks = Vec::new();
        let mut skipped = 0;
        let mut next_id = 1;

        for (device, files) in partition {
            for file in files {
                if succeeded.contains(&file.path) {
                    skipped += 1;
                    continue;
                }
                let task = Task::new(next_id, file.path.clone(), *device, file.size_bytes);
                next_id += 1;
                queue.push(task.clone())?;
                tasks.push(task);
            }
        }
        queue.close()?;

        if skipped > 0 {
            info!("根据清单跳过 {} 个已完成的文件", skipped);
        }
        Ok(WorkPlan {
            queue,
            tasks,
            skipped,
        })
    }

    pub fn estimate(&self, files: &[InputFile]) -> WorkloadEstimate {
        if files.is_empty() {
            return WorkloadEstimate::default();
        }
        let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
        WorkloadEstimate {
            count: files.len(),
            total_bytes,
            avg_bytes: total_bytes as f64 / files.len() as f64,
            min_bytes: files.iter().map(|f| f.size_bytes).min().unwrap_or(0),
            max_bytes: files.iter().map(|f| f.size_bytes).max().unwrap_or(0),
        }
    }

    pub fn distribution_stats(&self, partition: &Partition) -> DistributionStats {
        let files_per_device: BTreeMap<DeviceId, usize> = partition
            .iter()
            .map(|(device, files)| (*device, files.len()))
            .collect();
        let bytes_per_device: BTreeMap<DeviceId, u64> = partition
            .iter()
            .map(|(device, files)| (*device, files.iter().map(|f| f.size_bytes).sum()))
            .collect();

        let device_count = partition.len();
        let (avg_files_per_device, avg_bytes_per_device) = if device_count == 0 {
            (0.0, 0.0)
        } else {
            (
                files_per_device.values().sum::<usize>() as f64 / device_count as f64,
                bytes_per_device.values().sum::<u64>() as f64 / device_count as f64,
            )
        };

        DistributionStats {
            device_count,
            files_per_device,
            bytes_per_device,
            avg_files_per_device,
            avg_bytes_per_device,
        }
    }
}

struct FileMatcher {
    matcher: GlobMatcher,
    match_file_name: bool,
}

impl FileMatcher {
    fn new(pattern: &str) -> BatchResult<Self> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| BatchError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            matcher: glob.compile_matcher(),
            match_file_name: !pattern.contains('/'),
        })
    }

    fn is_match(&self, relative: &Path) -> bool {
        if self.match_file_name {
            relative
                .file_name()
                .is_some_and(|name| self.matcher.is_match(name))
        } else {
            self.matcher.is_match(relative)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_domain::{ManifestEntry, TaskState};
    use batch_worker::QueueItem;
    use std::fs;

    fn write(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![0u8; bytes]).unwrap();
        path
    }

    fn names(files: &[InputFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_validate_input_dir() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkloadAllocator::new();
        assert!(allocator.validate_input_dir(dir.path()).is_ok());
        assert!(matches!(
            allocator.validate_input_dir(&dir.path().join("missing")),
            Err(BatchError::InputNotFound(_))
        ));
        let file = write(dir.path(), "a.wav", 1);
        assert!(matches!(
            allocator.validate_input_dir(&file),
            Err(BatchError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_discover_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.wav", 10);
        write(dir.path(), "nested/deeper/a.wav", 20);
        write(dir.path(), "notes.txt", 5);

        let files = WorkloadAllocator::new().discover(dir.path(), "*.wav").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, dir.path().join("b.wav"));
        assert_eq!(files[1].path, dir.path().join("nested/deeper/a.wav"));
        assert_eq!(files[1].size_bytes, 20);
    }

    #[test]
    fn test_discover_with_path_pattern() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "day1/a.wav", 1);
        write(dir.path(), "day2/b.wav", 1);

        let files = WorkloadAllocator::new()
            .discover(dir.path(), "day1/*.wav")
            .unwrap();
        assert_eq!(names(&files), vec!["a.wav"]);
    }

    #[test]
    fn test_discover_errors() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.mp3", 1);
        let allocator = WorkloadAllocator::new();

        assert!(matches!(
            allocator.discover(dir.path(), "*.wav"),
            Err(BatchError::NoFilesFound { .. })
        ));
        assert!(matches!(
            allocator.discover(dir.path(), "[*.wav"),
            Err(BatchError::InvalidPattern { .. })
        ));
        assert!(matches!(
            allocator.discover(&dir.path().join("nope"), "*.wav"),
            Err(BatchError::InputNotFound(_))
        ));
    }

    #[test]
    fn test_partition_sorts_by_size_then_round_robin() {
        let files = vec![
            InputFile::new("/in/a", 10),
            InputFile::new("/in/b", 1),
            InputFile::new("/in/c", 8),
            InputFile::new("/in/d", 2),
        ];
        let devices = [DeviceId::Gpu(0), DeviceId::Gpu(1)];
        let partition = WorkloadAllocator::new().partition(&files, &devices);

        let sizes = |d: DeviceId| -> Vec<u64> {
            partition[&d].iter().map(|f| f.size_bytes).collect()
        };
        assert_eq!(sizes(DeviceId::Gpu(0)), vec![10, 2]);
        assert_eq!(sizes(DeviceId::Gpu(1)), vec![8, 1]);
    }

    #[test]
    fn test_partition_with_more_devices_than_files() {
        let files = vec![InputFile::new("/in/a", 3)];
        let devices = [DeviceId::Gpu(0), DeviceId::Gpu(1), DeviceId::Gpu(2)];
        let partition = WorkloadAllocator::new().partition(&files, &devices);

        assert_eq!(partition.len(), 3);
        assert_eq!(partition[&DeviceId::Gpu(0)].len(), 1);
        assert!(partition[&DeviceId::Gpu(1)].is_empty());
        assert!(partition[&DeviceId::Gpu(2)].is_empty());
    }

    #[test]
    fn test_partition_ties_keep_path_order() {
        let files = vec![
            InputFile::new("/in/a", 5),
            InputFile::new("/in/b", 5),
            InputFile::new("/in/c", 5),
        ];
        let partition = WorkloadAllocator::new().partition(&files, &[DeviceId::Gpu(0), DeviceId::Gpu(1)]);
        assert_eq!(partition[&DeviceId::Gpu(0)][0].path, PathBuf::from("/in/a"));
        assert_eq!(partition[&DeviceId::Gpu(1)][0].path, PathBuf::from("/in/b"));
        assert_eq!(partition[&DeviceId::Gpu(0)][1].path, PathBuf::from("/in/c"));
    }

    #[tokio::test]
    async fn test_build_queue_skips_manifest_successes() {
        let files = vec![
            InputFile::new("/in/a", 10),
            InputFile::new("/in/b", 8),
            InputFile::new("/in/c", 2),
        ];
        let devices = [DeviceId::Gpu(0), DeviceId::Gpu(1)];
        let allocator = WorkloadAllocator::new();
        let partition = allocator.partition(&files, &devices);

        let mut manifest = BatchManifest::new("/in", "*");
        manifest.upsert(ManifestEntry {
            input_path: PathBuf::from("/in/a"),
            assigned_device: DeviceId::Gpu(0),
            status: TaskState::Succeeded,
            error: None,
            duration_seconds: Some(1.0),
            attempts: 1,
        });
        manifest.upsert(ManifestEntry {
            input_path: PathBuf::from("/in/b"),
            assigned_device: DeviceId::Gpu(1),
            status: TaskState::Failed,
            error: Some("boom".to_string()),
            duration_seconds: Some(1.0),
            attempts: 3,
        });

        let plan = allocator.build_queue(&partition, Some(&manifest)).unwrap();
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.tasks.len(), 2);
        assert!(plan.tasks.iter().all(|t| t.state == TaskState::Pending));

        let gpu0 = plan.queue.receiver(DeviceId::Gpu(0)).unwrap();
        match gpu0.recv().await.unwrap() {
            QueueItem::Task(task) => assert_eq!(task.input_path, PathBuf::from("/in/c")),
            other => panic!("unexpected item {other:?}"),
        }
        assert_eq!(gpu0.recv().await.unwrap(), QueueItem::Sentinel);

        let gpu1 = plan.queue.receiver(DeviceId::Gpu(1)).unwrap();
        match gpu1.recv().await.unwrap() {
            QueueItem::Task(task) => {
                assert_eq!(task.input_path, PathBuf::from("/in/b"));
                assert_eq!(task.assigned_device, DeviceId::Gpu(1));
            }
            other => panic!("unexpected item {other:?}"),
        }
        assert_eq!(gpu1.recv().await.unwrap(), QueueItem::Sentinel);
    }

    #[test]
    fn test_estimate_and_distribution() {
        let allocator = WorkloadAllocator::new();
        assert_eq!(allocator.estimate(&[]), WorkloadEstimate::default());

        let files = vec![
            InputFile::new("/in/a", 10),
            InputFile::new("/in/b", 1),
            InputFile::new("/in/c", 7),
        ];
        let estimate = allocator.estimate(&files);
        assert_eq!(estimate.count, 3);
        assert_eq!(estimate.total_bytes, 18);
        assert_eq!(estimate.avg_bytes, 6.0);
        assert_eq!(estimate.min_bytes, 1);
        assert_eq!(estimate.max_bytes, 10);

        let partition = allocator.partition(&files, &[DeviceId::Gpu(0), DeviceId::Gpu(1)]);
        let stats = allocator.distribution_stats(&partition);
        assert_eq!(stats.device_count, 2);
        assert_eq!(stats.files_per_device[&DeviceId::Gpu(0)], 2);
        assert_eq!(stats.bytes_per_device[&DeviceId::Gpu(0)], 11);
        assert_eq!(stats.bytes_per_device[&DeviceId::Gpu(1)], 7);
        assert_eq!(stats.avg_files_per_device, 1.5);
        assert_eq!(stats.avg_bytes_per_device, 9.0);
    }
}
