use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use batch_config::SchedulerConfig;
use batch_domain::{BatchManifest, DeviceId, DeviceInfo, ManifestEntry, MetricsSnapshot, TaskResult};
use batch_errors::{BatchError, BatchResult};
use batch_worker::{WorkerLaunch, WorkerStatus, WorkerSupervisor};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::allocator::{DistributionStats, WorkloadAllocator, WorkloadEstimate};
use crate::device_detector::DeviceDetector;
use crate::manifest::ManifestStore;
use crate::progress::{FailureRecord, ProgressAggregator, ProgressUpdate};

/// 收尾阶段等待剩余结果的额外时间
const DRAIN_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Validating,
    Discovering,
    Spawning,
    Monitoring,
    Completed,
    TimedOut,
    Cancelled,
    SetupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    TimedOut,
    Cancelled,
    SetupFailed,
}

/// 一次运行的参数
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub root: PathBuf,
    pub output_dir: PathBuf,
    /// "auto" 或逗号分隔的设备列表
    pub devices: String,
    pub pattern: String,
    pub timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&SchedulerConfig::default(), root, output_dir)
    }

    pub fn from_config(
        config: &SchedulerConfig,
        root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            output_dir: output_dir.into(),
            devices: config.devices.clone(),
            pattern: config.pattern.clone(),
            timeout: config.timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// 0 全部成功，1 存在失败或未完成的任务，2 启动前的致命错误
    pub exit_code: i32,
    pub snapshot: MetricsSnapshot,
    pub failures: Vec<FailureRecord>,
    /// 本次提交的任务数（不含清单中已成功的文件）
    pub submitted: usize,
    pub skipped: usize,
    /// Worker异常退出后仍留在队列中的任务数
    pub pending: usize,
    pub setup_error: Option<String>,
    pub manifest_path: Option<PathBuf>,
    #[serde(skip)]
    pub workers: Vec<WorkerStatus>,
}

impl RunReport {
    fn setup_failed(error: &BatchError) -> Self {
        Self {
            outcome: RunOutcome::SetupFailed,
            exit_code: 2,
            snapshot: MetricsSnapshot::default(),
            failures: Vec::new(),
            submitted: 0,
            skipped: 0,
            pending: 0,
            setup_error: Some(error.to_string()),
            manifest_path: None,
            workers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadInfo {
    pub root: PathBuf,
    pub pattern: String,
    pub estimate: WorkloadEstimate,
    pub distribution: DistributionStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
    pub count: usize,
    pub ids: Vec<DeviceId>,
    pub accelerator_available: bool,
    pub details: Vec<DeviceInfo>,
}

/// 组合设备检测、分配、Worker监管与进度汇总，完成一次批处理运行
pub struct Orchestrator {
    detector: DeviceDetector,
    allocator: WorkloadAllocator,
    launch: WorkerLaunch,
    config: SchedulerConfig,
    cancel: CancellationToken,
    state: RunState,
}

impl Orchestrator {
    pub fn new(detector: DeviceDetector, launch: WorkerLaunch, config: SchedulerConfig) -> Self {
        Self {
            detector,
            allocator: WorkloadAllocator::new(),
            launch,
            config,
            cancel: CancellationToken::new(),
            state: RunState::Idle,
        }
    }

    /// 使用外部取消令牌（如Ctrl+C处理）
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn detector(&self) -> &DeviceDetector {
        &self.detector
    }

    fn transition(&mut self, next: RunState) {
        debug!("运行状态: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// 启动前校验：设备可用、输入目录存在且包含匹配文件
    pub fn validate(&self, root: &Path, pattern: &str, devices: &[DeviceId]) -> BatchResult<()> {
        self.allocator.validate_input_dir(root)?;
        self.detector.validate(devices)?;
        self.allocator.discover(root, pattern)?;
        Ok(())
    }

    pub fn workload_info(&self, root: &Path, pattern: &str) -> BatchResult<WorkloadInfo> {
        let files = self.allocator.discover(root, pattern)?;
        let partition = self
            .allocator
            .partition(&files, &self.detector.available_ids());
        Ok(WorkloadInfo {
            root: root.to_path_buf(),
            pattern: pattern.to_string(),
            estimate: self.allocator.estimate(&files),
            distribution: self.allocator.distribution_stats(&partition),
        })
    }

    pub fn device_info(&self) -> DeviceReport {
        let ids = self.detector.available_ids();
        DeviceReport {
            count: ids.len(),
            accelerator_available: self.detector.is_accelerator_available(),
            details: ids.iter().map(|id| self.detector.describe(*id)).collect(),
            ids,
        }
    }

    /// 执行一次完整运行并返回报告，启动前的错误以退出码2报告
    pub async fn run(&mut self, request: &RunRequest) -> RunReport {
        info!(
            root = %request.root.display(),
            output_dir = %request.output_dir.display(),
            devices = %request.devices,
            pattern = %request.pattern,
            "开始批处理运行"
        );

        match self.execute(request).await {
            Ok(report) => report,
            Err(e) => {
                error!("启动前校验失败: {}", e);
                self.transition(RunState::SetupFailed);
                RunReport::setup_failed(&e)
            }
        }
    }

    async fn execute(&mut self, request: &RunRequest) -> BatchResult<RunReport> {
        self.transition(RunState::Validating);
        let devices = self.detector.parse_spec(&request.devices)?;
        self.validate(&request.root, &request.pattern, &devices)?;

        self.transition(RunState::Discovering);
        let root = std::fs::canonicalize(&request.root).unwrap_or_else(|_| request.root.clone());
        let files = self.allocator.discover(&root, &request.pattern)?;

        std::fs::create_dir_all(&request.output_dir)?;
        let store = ManifestStore::in_output_dir(&request.output_dir, &self.config.manifest_file_name);
        let mut manifest = self.open_manifest(&store, &root, &request.pattern);

        let partition = self.allocator.partition(&files, &devices);
        let plan = self.allocator.build_queue(&partition, Some(&manifest))?;
        for task in &plan.tasks {
            manifest.upsert(ManifestEntry::from_task(task));
        }
        self.print_banner(files.len(), plan.tasks.len(), &devices, &request.output_dir);

        if plan.tasks.is_empty() {
            info!("所有文件均已在之前的运行中完成，无需处理");
            self.transition(RunState::Completed);
            save_manifest(&store, &manifest);
            let mut aggregator = ProgressAggregator::new(&devices);
            aggregator.finish();
            return Ok(RunReport {
                outcome: RunOutcome::Completed,
                exit_code: 0,
                snapshot: aggregator.snapshot(),
                failures: Vec::new(),
                submitted: 0,
                skipped: plan.skipped,
                pending: 0,
                setup_error: None,
                manifest_path: Some(store.path().to_path_buf()),
                workers: Vec::new(),
            });
        }
        if self.config.incremental_manifest {
            save_manifest(&store, &manifest);
        }

        self.transition(RunState::Spawning);
        let total = plan.tasks.len();
        let grace = self.config.grace_period();
        let mut aggregator = ProgressAggregator::new(&devices);
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<TaskResult>();
        let mut supervisor = WorkerSupervisor::new(self.launch.clone(), &request.output_dir, grace);

        let spawned = supervisor
            .spawn(&devices, &plan.queue, results_tx)
            .map(|workers| workers.len());
        if let Err(e) = spawned {
            error!("启动Worker失败: {}", e);
            supervisor.terminate_all().await;
            return Err(e);
        }

        self.transition(RunState::Monitoring);
        let incremental = self.config.incremental_manifest;
        let mut on_progress = |update: &ProgressUpdate<'_>| {
            println!("{}", update.line());
            manifest.upsert(ManifestEntry::from_result(update.result));
            if incremental {
                save_manifest(&store, &manifest);
            }
        };

        let outcome = {
            let monitor = aggregator.monitor(&mut results_rx, total, &mut on_progress);
            tokio::select! {
                _ = monitor => RunOutcome::Completed,
                _ = sleep_or_forever(request.timeout) => {
                    warn!("运行超时: {:?}", request.timeout);
                    RunOutcome::TimedOut
                }
                _ = self.cancel.cancelled() => {
                    warn!("收到取消信号，停止运行");
                    RunOutcome::Cancelled
                }
            }
        };

        match outcome {
            RunOutcome::Completed => {
                if !supervisor.await_completion(Some(grace)).await {
                    let killed = supervisor.terminate_all().await;
                    if killed > 0 {
                        warn!("{} 个Worker未按时退出，已强制终止", killed);
                    }
                }
            }
            _ => {
                supervisor.terminate_all().await;
            }
        }

        // 收集停止过程中产生的结果
        let drain = aggregator.monitor(&mut results_rx, total, &mut on_progress);
        if tokio::time::timeout(grace + DRAIN_SLACK, drain).await.is_err() {
            warn!("等待剩余结果超时");
        }
        drop(on_progress);
        if tokio::time::timeout(DRAIN_SLACK, supervisor.join()).await.is_err() {
            warn!("等待Worker监管任务结束超时");
        }

        let leftovers = plan.queue.drain_remaining();
        let mut pending = 0;
        for task in leftovers {
            if outcome == RunOutcome::Completed {
                // Worker异常退出，剩余任务保持Pending以便下次续跑
                warn!(
                    device = %task.assigned_device,
                    "任务未被处理: {}",
                    task.input_path.display()
                );
                pending += 1;
                continue;
            }
            let cause = BatchError::cancelled(format!(
                "运行{}，任务未开始",
                if outcome == RunOutcome::TimedOut { "超时" } else { "被取消" }
            ));
            let result = TaskResult::failed(&task, 0.0, 0, cause.to_string());
            manifest.upsert(ManifestEntry::from_result(&result));
            aggregator.record(result);
        }

        self.transition(match outcome {
            RunOutcome::Completed => RunState::Completed,
            RunOutcome::TimedOut => RunState::TimedOut,
            RunOutcome::Cancelled => RunState::Cancelled,
            RunOutcome::SetupFailed => RunState::SetupFailed,
        });

        aggregator.finish();
        println!("{}", aggregator.summary());
        aggregator.log_summary();
        save_manifest(&store, &manifest);

        let workers = supervisor.status();
        for status in &workers {
            debug!(
                device = %status.device,
                "Worker 状态: exit_code={:?}, 完成任务 {}, 强制终止 {}",
                status.exit_code,
                status.tasks_finished,
                status.force_killed
            );
        }

        let exit_code = if aggregator.failures().is_empty() && pending == 0 {
            0
        } else {
            1
        };
        if pending > 0 {
            warn!("{} 个任务因Worker异常退出未被处理，可重新运行以继续", pending);
        }

        Ok(RunReport {
            outcome,
            exit_code,
            snapshot: aggregator.snapshot(),
            failures: aggregator.failures().to_vec(),
            submitted: total,
            skipped: plan.skipped,
            pending,
            setup_error: None,
            manifest_path: Some(store.path().to_path_buf()),
            workers,
        })
    }

    fn open_manifest(&self, store: &ManifestStore, root: &Path, pattern: &str) -> BatchManifest {
        let mut manifest = match store.load() {
            Ok(Some(manifest)) => manifest,
            Ok(None) => BatchManifest::new(root, pattern),
            Err(e) => {
                warn!("清单无法读取，将重新开始: {}", e);
                BatchManifest::new(root, pattern)
            }
        };
        manifest.run_id = uuid::Uuid::new_v4();
        manifest.root = root.to_path_buf();
        manifest.pattern = pattern.to_string();
        manifest.host = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned());
        manifest
    }

    fn print_banner(&self, files: usize, submitted: usize, devices: &[DeviceId], output_dir: &Path) {
        let device_list = devices
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            files,
            submitted,
            devices = %device_list,
            output_dir = %output_dir.display(),
            "批处理任务已就绪"
        );
        println!("\n=== Batch Run ===");
        println!("Files: {files} ({submitted} to process)");
        println!("Devices: [{device_list}]");
        println!("Output: {}\n", output_dir.display());
    }
}

fn save_manifest(store: &ManifestStore, manifest: &BatchManifest) {
    if let Err(e) = store.save(manifest) {
        error!("保存清单失败: {}", e);
    }
}

fn sleep_or_forever(timeout: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    }
}
