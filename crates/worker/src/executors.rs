use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use batch_config::ProcessorConfig;
use batch_domain::{ProcessOutput, Task};
use batch_errors::{BatchError, BatchResult};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

/// 单个任务的外部处理契约
///
/// 成功时返回产出；`BatchError::Transient`/`Timeout` 会被重试，其余错误视为终态失败。
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &Task, attempt: u32) -> BatchResult<ProcessOutput>;

    fn name(&self) -> &str;
}

/// 处理命令可在stdout最后一行输出的报告
#[derive(Debug, Deserialize)]
struct ProcessorReport {
    audio_duration_seconds: Option<f64>,
}

/// 通过 shell 执行外部命令处理任务
pub struct ShellProcessor {
    command: String,
    transient_exit_codes: Vec<i32>,
    timeout: Option<Duration>,
    output_dir: PathBuf,
}

impl ShellProcessor {
    pub fn new(command: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            transient_exit_codes: vec![75],
            timeout: None,
            output_dir: output_dir.into(),
        }
    }

    pub fn from_config(config: &ProcessorConfig, output_dir: impl Into<PathBuf>) -> BatchResult<Self> {
        if !config.is_configured() {
            return Err(BatchError::config_error("processor.shell_command 未配置"));
        }
        Ok(Self {
            command: config.shell_command.clone(),
            transient_exit_codes: config.transient_exit_codes.clone(),
            timeout: config.timeout_seconds.map(Duration::from_secs),
            output_dir: output_dir.into(),
        })
    }

    pub fn with_transient_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.transient_exit_codes = codes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn task_output_dir(&self, task: &Task) -> PathBuf {
        let stem = task
            .input_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("task-{}", task.id));
        self.output_dir.join(stem)
    }

    fn render_command(&self, input: &Path, output_dir: &Path) -> String {
        self.command
            .replace("{input}", &shell_quote(&input.to_string_lossy()))
            .replace("{output_dir}", &shell_quote(&output_dir.to_string_lossy()))
    }
}

#[async_trait]
impl TaskProcessor for ShellProcessor {
    async fn process(&self, task: &Task, attempt: u32) -> BatchResult<ProcessOutput> {
        let task_output_dir = self.task_output_dir(task);
        tokio::fs::create_dir_all(&task_output_dir).await?;

        let rendered = self.render_command(&task.input_path, &task_output_dir);
        info!(
            task_id = task.id,
            attempt,
            "执行处理命令: task_id={}, command={}",
            task.id,
            rendered
        );

        let mut cmd = shell_command(&rendered);
        cmd.env("BATCH_INPUT_PATH", &task.input_path)
            .env("BATCH_OUTPUT_DIR", &task_output_dir)
            .env("BATCH_TASK_ID", task.id.to_string())
            .env("BATCH_ATTEMPT", attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| BatchError::task_execution(format!("启动处理命令失败: {e}")))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| BatchError::Timeout(format!("处理命令超过 {limit:?} 未完成")))??,
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => {
                let report = stdout
                    .lines()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .and_then(|line| serde_json::from_str::<ProcessorReport>(line.trim()).ok());
                debug!(task_id = task.id, "处理命令完成: {:?}", report);
                Ok(ProcessOutput {
                    audio_duration_seconds: report.and_then(|r| r.audio_duration_seconds),
                    output_dir: Some(task_output_dir),
                })
            }
            Some(code) if self.transient_exit_codes.contains(&code) => Err(BatchError::transient(
                format!("处理命令返回临时错误码 {code}: {}", tail(&stderr)),
            )),
            Some(code) => Err(BatchError::task_execution(format!(
                "处理命令执行失败，退出码 {code}: {}",
                tail(&stderr)
            ))),
            None => Err(BatchError::task_execution(format!(
                "处理命令被信号终止: {}",
                tail(&stderr)
            ))),
        }
    }

    fn name(&self) -> &str {
        "shell"
    }
}

fn tail(text: &str) -> String {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

#[cfg(unix)]
fn shell_command(rendered: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(rendered);
    cmd
}

#[cfg(windows)]
fn shell_command(rendered: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(rendered);
    cmd
}

#[cfg(unix)]
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(windows)]
fn shell_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}
