use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use batch_config::AppConfig;
use batch_dispatcher::{DeviceDetector, NvidiaSmiProbe, Orchestrator, RunReport, RunRequest};
use batch_domain::protocol::encode_line;
use batch_domain::{DeviceId, WorkerEvent};
use batch_errors::{BatchError, BatchResult};
use batch_worker::{RetryPolicy, ShellProcessor, WorkerLaunch, WorkerRuntime};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::{error, info};

use crate::shutdown::{ignore_interrupts, ShutdownManager};

/// 父进程为每个Worker设置的环境变量
pub const WORKER_DEVICE_ENV: &str = "BATCH_WORKER_DEVICE";
pub const WORKER_OUTPUT_DIR_ENV: &str = "BATCH_OUTPUT_DIR";
/// 命令行指定的处理命令通过配置的环境变量覆盖传给Worker
const PROCESSOR_COMMAND_ENV: &str = "BATCH__PROCESSOR__SHELL_COMMAND";

/// `run` 子命令的参数
#[derive(Debug, Clone, Default)]
pub struct BatchArgs {
    pub input: PathBuf,
    pub output: PathBuf,
    pub devices: Option<String>,
    pub pattern: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub command: Option<String>,
    /// 运行结束后将报告以JSON写入该文件
    pub report: Option<PathBuf>,
}

pub struct Application {
    config: AppConfig,
    config_path: Option<String>,
    /// 转发给Worker子进程的全局参数（日志级别、格式）
    worker_args: Vec<String>,
    shutdown: ShutdownManager,
}

impl Application {
    pub fn new(config: AppConfig, config_path: Option<String>, worker_args: Vec<String>) -> Self {
        Self {
            config,
            config_path,
            worker_args,
            shutdown: ShutdownManager::new(),
        }
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    fn detector(&self) -> DeviceDetector {
        DeviceDetector::new(Box::new(NvidiaSmiProbe::new(
            &self.config.scheduler.nvidia_smi_program,
        )))
    }

    fn worker_launch(&self, command: Option<&str>) -> BatchResult<WorkerLaunch> {
        let mut launch = WorkerLaunch::current_exe()?;
        if let Some(path) = &self.config_path {
            launch = launch.arg("--config").arg(path);
        }
        for arg in &self.worker_args {
            launch = launch.arg(arg);
        }
        if let Some(command) = command {
            launch = launch.env(PROCESSOR_COMMAND_ENV, command);
        }
        Ok(launch)
    }

    fn orchestrator(&self, command: Option<&str>) -> BatchResult<Orchestrator> {
        let launch = self.worker_launch(command)?;
        Ok(
            Orchestrator::new(self.detector(), launch, self.config.scheduler.clone())
                .with_cancellation(self.shutdown.token()),
        )
    }

    /// 执行批处理，返回进程退出码
    pub async fn run_batch(&self, args: &BatchArgs) -> i32 {
        let command = args
            .command
            .clone()
            .unwrap_or_else(|| self.config.processor.shell_command.clone());
        if command.trim().is_empty() {
            let e = BatchError::config_error("未配置处理命令，请使用 --command 或 processor.shell_command");
            error!("{}", e);
            eprintln!("错误: {e}");
            return 2;
        }

        let mut orchestrator = match self.orchestrator(args.command.as_deref()) {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                error!("初始化调度器失败: {}", e);
                eprintln!("错误: {e}");
                return 2;
            }
        };

        let scheduler = &self.config.scheduler;
        let request = RunRequest {
            root: args.input.clone(),
            output_dir: args.output.clone(),
            devices: args
                .devices
                .clone()
                .unwrap_or_else(|| scheduler.devices.clone()),
            pattern: args
                .pattern
                .clone()
                .unwrap_or_else(|| scheduler.pattern.clone()),
            timeout: args
                .timeout_seconds
                .map(Duration::from_secs)
                .or_else(|| scheduler.timeout()),
        };

        let listener = self.shutdown.listen_for_signals();
        let report = orchestrator.run(&request).await;
        listener.abort();

        if let Some(e) = &report.setup_error {
            eprintln!("错误: {e}");
        }
        if let Some(path) = &args.report {
            if let Err(e) = write_report(&report, path) {
                error!("写入运行报告失败: {:#}", e);
            }
        }
        info!(
            outcome = ?report.outcome,
            exit_code = report.exit_code,
            "批处理运行结束"
        );
        report.exit_code
    }

    /// Worker子进程入口：从环境变量读取设备，通过stdin/stdout与父进程通信
    pub async fn run_worker(&self) -> i32 {
        let _interrupts = ignore_interrupts();

        let device = match std::env::var(WORKER_DEVICE_ENV) {
            Ok(value) => match value.parse::<DeviceId>() {
                Ok(device) => device,
                Err(e) => return report_fatal(&e),
            },
            Err(_) => {
                return report_fatal(&BatchError::config_error(format!(
                    "缺少环境变量 {WORKER_DEVICE_ENV}"
                )))
            }
        };
        let output_dir = std::env::var_os(WORKER_OUTPUT_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let processor = match ShellProcessor::from_config(&self.config.processor, output_dir) {
            Ok(processor) => processor,
            Err(e) => return report_fatal(&e),
        };
        let runtime = WorkerRuntime::new(
            device,
            Arc::new(processor),
            RetryPolicy::from_config(&self.config.retry),
        );

        match runtime.run_stdio().await {
            Ok(processed) => {
                info!(device = %device, "Worker 正常退出，共处理 {} 个任务", processed);
                0
            }
            Err(e) => {
                error!(device = %device, "Worker 异常退出: {}", e);
                1
            }
        }
    }

    pub fn show_devices(&self, json: bool) -> Result<()> {
        let report = self.orchestrator(None)?.device_info();
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!(
            "检测到 {} 个设备 (加速器可用: {})",
            report.count, report.accelerator_available
        );
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Device", "Name", "Memory (MB)", "Compute"]);
        for (id, info) in report.ids.iter().zip(&report.details) {
            table.add_row(vec![
                id.to_string(),
                info.name.clone().unwrap_or_else(|| "-".to_string()),
                info.total_memory
                    .map(|bytes| (bytes / (1024 * 1024)).to_string())
                    .unwrap_or_else(|| "-".to_string()),
                info.compute_capability
                    .map(|(major, minor)| format!("{major}.{minor}"))
                    .unwrap_or_else(|| "-".to_string()),
            ]);
        }
        println!("{table}");
        Ok(())
    }

    pub fn show_estimate(&self, input: &std::path::Path, pattern: Option<&str>, json: bool) -> Result<()> {
        let pattern = pattern.unwrap_or(&self.config.scheduler.pattern);
        let info = self
            .orchestrator(None)?
            .workload_info(input, pattern)
            .with_context(|| format!("无法估算工作负载: {}", input.display()))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&info)?);
            return Ok(());
        }

        let estimate = &info.estimate;
        println!("Files: {}", estimate.count);
        println!(
            "Total size: {:.2} MB (avg {:.2} MB, min {} B, max {} B)",
            estimate.total_bytes as f64 / (1024.0 * 1024.0),
            estimate.avg_bytes / (1024.0 * 1024.0),
            estimate.min_bytes,
            estimate.max_bytes
        );

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Device", "Files", "Bytes"]);
        for (device, files) in &info.distribution.files_per_device {
            let bytes = info
                .distribution
                .bytes_per_device
                .get(device)
                .copied()
                .unwrap_or_default();
            table.add_row(vec![device.to_string(), files.to_string(), bytes.to_string()]);
        }
        println!("{table}");
        Ok(())
    }
}

/// 初始化失败时告知父进程，随后以退出码1结束
fn report_fatal(error: &BatchError) -> i32 {
    error!("Worker 无法启动: {}", error);
    if let Ok(line) = encode_line(&WorkerEvent::Fatal {
        error: error.to_string(),
    }) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(line.as_bytes());
        let _ = stdout.flush();
    }
    1
}

fn write_report(report: &RunReport, path: &std::path::Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("无法写入 {}", path.display()))
}
