use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use batch_config::{AppConfig, LogLevel, OutputFormat};
use batch_scheduler::app::{Application, BatchArgs};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "batch-scheduler", version, about = "本地多设备批处理任务调度系统")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<String>,

    /// 日志级别
    #[arg(short = 'l', long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// 日志格式
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 在所有设备上并行处理目录中的文件
    Run {
        /// 输入目录
        input: PathBuf,
        /// 输出目录，清单文件也写在这里
        #[arg(short, long)]
        output: PathBuf,
        /// "auto" 或逗号分隔的设备列表，例如 "0,1" 或 "cpu"
        #[arg(short, long)]
        devices: Option<String>,
        /// 文件名匹配模式
        #[arg(short, long)]
        pattern: Option<String>,
        /// 整体超时（秒）
        #[arg(long, value_name = "SECONDS")]
        timeout: Option<u64>,
        /// 处理单个文件的shell命令，覆盖配置中的 processor.shell_command
        #[arg(long, value_name = "SHELL")]
        command: Option<String>,
        /// 将运行报告以JSON写入文件
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
    /// 列出可用设备
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// 估算目录的工作负载及在设备间的分配
    Estimate {
        input: PathBuf,
        #[arg(short, long)]
        pattern: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Worker子进程入口，由调度器启动
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("错误: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = AppConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;

    let log_level = cli.log_level.unwrap_or(config.logging.level);
    let log_format = cli.log_format.unwrap_or(config.logging.format);
    init_logging(log_level, log_format)?;

    let worker_args = vec![
        "--log-level".to_string(),
        log_level.to_string(),
        "--log-format".to_string(),
        log_format.to_string(),
    ];
    let app = Application::new(config, cli.config.clone(), worker_args);

    let code = match cli.command {
        Commands::Run {
            input,
            output,
            devices,
            pattern,
            timeout,
            command,
            report,
        } => {
            info!("启动批处理: {}", input.display());
            let args = BatchArgs {
                input,
                output,
                devices,
                pattern,
                timeout_seconds: timeout,
                command,
                report,
            };
            app.run_batch(&args).await
        }
        Commands::Worker => app.run_worker().await,
        Commands::Devices { json } => {
            app.show_devices(json)?;
            0
        }
        Commands::Estimate {
            input,
            pattern,
            json,
        } => {
            app.show_estimate(&input, pattern.as_deref(), json)?;
            0
        }
    };

    Ok(u8::try_from(code).unwrap_or(1))
}

/// 初始化日志系统
///
/// 日志统一写入stderr：父进程的stdout用于进度输出，Worker的stdout用于通信协议。
fn init_logging(log_level: LogLevel, log_format: OutputFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        OutputFormat::Json => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        OutputFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
    }

    Ok(())
}
