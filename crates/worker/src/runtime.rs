use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use batch_domain::protocol::{decode_line, encode_line};
use batch_domain::{DeviceId, Task, TaskResult, WorkerCommand, WorkerEvent};
use batch_errors::{BatchError, BatchResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::executors::TaskProcessor;
use crate::retry::RetryPolicy;

/// 子进程内的工作循环
///
/// 通过stdin接收 `WorkerCommand`，通过stdout发送 `WorkerEvent`。
/// 单个任务失败不会终止循环；收到 `shutdown` 或stdin关闭时退出。
pub struct WorkerRuntime {
    device: DeviceId,
    processor: Arc<dyn TaskProcessor>,
    retry_policy: RetryPolicy,
}

impl WorkerRuntime {
    pub fn new(device: DeviceId, processor: Arc<dyn TaskProcessor>, retry_policy: RetryPolicy) -> Self {
        Self {
            device,
            processor,
            retry_policy,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// 以进程的stdin/stdout运行
    pub async fn run_stdio(&self) -> BatchResult<usize> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.run(stdin, stdout).await
    }

    /// 运行直到收到shutdown或输入结束，返回处理完成的任务数
    pub async fn run<R, W>(&self, reader: R, writer: W) -> BatchResult<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let serve = self.serve(reader.lines(), events_tx);
        let pump = pump_events(events_rx, writer);
        let (served, pumped) = tokio::join!(serve, pump);
        pumped?;
        served
    }

    async fn serve<R>(
        &self,
        mut commands: Lines<R>,
        events: UnboundedSender<WorkerEvent>,
    ) -> BatchResult<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        info!(device = %self.device, processor = self.processor.name(), "Worker 启动: device={}", self.device);
        let mut processed = 0;

        loop {
            let _ = events.send(WorkerEvent::Ready {
                device: self.device,
            });

            let task = match next_command(&mut commands).await {
                Ok(Some(WorkerCommand::Execute { task })) => task,
                Ok(Some(WorkerCommand::Shutdown)) => {
                    info!(device = %self.device, "收到shutdown指令，Worker 退出");
                    break;
                }
                Ok(None) => {
                    info!(device = %self.device, "指令通道已关闭，Worker 退出");
                    break;
                }
                Err(e) => {
                    error!(device = %self.device, "指令解析失败: {}", e);
                    let _ = events.send(WorkerEvent::Fatal {
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };

            let started = Instant::now();
            let attempts = AtomicU32::new(0);
            let execution = self.execute(&task, &attempts, &events);
            tokio::pin!(execution);

            tokio::select! {
                result = &mut execution => {
                    processed += 1;
                    let _ = events.send(WorkerEvent::Finished { result });
                }
                command = next_command(&mut commands) => {
                    match command {
                        Ok(Some(WorkerCommand::Execute { task: extra })) => {
                            warn!(device = %self.device, "任务 {} 执行中收到新任务 {}，按shutdown处理", task.id, extra.id);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(device = %self.device, "任务执行中指令解析失败: {}", e),
                    }
                    warn!(device = %self.device, task_id = task.id, "任务 {} 被取消", task.id);
                    let result = TaskResult::failed(
                        &task,
                        started.elapsed().as_secs_f64(),
                        attempts.load(Ordering::SeqCst),
                        BatchError::cancelled(format!("任务 {} 在设备 {} 上执行时被取消", task.file_name(), self.device)).to_string(),
                    );
                    let _ = events.send(WorkerEvent::Finished { result });
                    break;
                }
            }
        }

        Ok(processed)
    }

    async fn execute(
        &self,
        task: &Task,
        attempts: &AtomicU32,
        events: &UnboundedSender<WorkerEvent>,
    ) -> TaskResult {
        let started = Instant::now();
        let operation = format!("process {}", task.file_name());

        let outcome = self
            .retry_policy
            .retry_with_observer(
                &operation,
                |attempt| {
                    attempts.store(attempt, Ordering::SeqCst);
                    let _ = events.send(WorkerEvent::Started {
                        task_id: task.id,
                        attempt,
                    });
                    self.processor.process(task, attempt)
                },
                |attempt, delay, err: &BatchError| {
                    let _ = events.send(WorkerEvent::Retrying {
                        task_id: task.id,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: err.to_string(),
                    });
                },
            )
            .await;

        let duration = started.elapsed().as_secs_f64();
        let attempt_count = attempts.load(Ordering::SeqCst);

        match outcome {
            Ok(output) => {
                info!(
                    device = %self.device,
                    task_id = task.id,
                    attempts = attempt_count,
                    "任务完成: {} ({:.2}s)",
                    task.file_name(),
                    duration
                );
                TaskResult::succeeded(task, duration, &output, attempt_count)
            }
            Err(e) => {
                error!(
                    device = %self.device,
                    task_id = task.id,
                    attempts = attempt_count,
                    error = %e,
                    "任务失败: {}",
                    task.file_name()
                );
                TaskResult::failed(task, duration, attempt_count, e.to_string())
            }
        }
    }
}

async fn next_command<R>(commands: &mut Lines<R>) -> BatchResult<Option<WorkerCommand>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match commands.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return decode_line(&line).map(Some),
            None => return Ok(None),
        }
    }
}

async fn pump_events<W>(mut events: UnboundedReceiver<WorkerEvent>, mut writer: W) -> BatchResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        let line = encode_line(&event)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        debug!("已发送事件: {}", line.trim_end());
    }
    Ok(())
}
