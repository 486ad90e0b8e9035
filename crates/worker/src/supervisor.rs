use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use batch_domain::protocol::{decode_line, encode_line};
use batch_domain::{DeviceId, Task, TaskId, TaskResult, TaskState, WorkerCommand, WorkerEvent};
use batch_errors::{BatchError, BatchResult};
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueItem, TaskQueue};

/// 子进程退出后等待其退出码的上限
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(5);

/// 启动Worker子进程的命令
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerLaunch {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// 当前可执行文件的 `worker` 子命令
    pub fn current_exe() -> BatchResult<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, device: DeviceId, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CUDA_VISIBLE_DEVICES", device.visible_devices_env())
            .env("BATCH_WORKER_DEVICE", device.to_string())
            .env("BATCH_OUTPUT_DIR", output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// 单个Worker进程的诊断状态
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub device: DeviceId,
    pub pid: Option<u32>,
    pub alive: bool,
    pub exit_code: Option<i32>,
    pub force_killed: bool,
    pub current_task: Option<TaskId>,
    pub tasks_finished: u64,
}

impl WorkerStatus {
    fn started(device: DeviceId, pid: Option<u32>) -> Self {
        Self {
            device,
            pid,
            alive: true,
            exit_code: None,
            force_killed: false,
            current_task: None,
            tasks_finished: 0,
        }
    }
}

pub struct WorkerHandle {
    device: DeviceId,
    status: Arc<watch::Sender<WorkerStatus>>,
    kill: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.status.borrow().alive
    }

    async fn wait_exited(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| !s.alive).await;
    }
}

/// 每个设备一个Worker子进程的监管者
///
/// 父进程侧为每个Worker运行一个代理：子进程报告 `ready` 时从该设备的队列取任务，
/// 取到哨兵或收到停止信号时发送 `shutdown`。
pub struct WorkerSupervisor {
    launch: WorkerLaunch,
    output_dir: PathBuf,
    grace_period: Duration,
    shutdown: CancellationToken,
    workers: Vec<WorkerHandle>,
}

impl WorkerSupervisor {
    pub fn new(launch: WorkerLaunch, output_dir: impl Into<PathBuf>, grace_period: Duration) -> Self {
        Self {
            launch,
            output_dir: output_dir.into(),
            grace_period,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// 为每个设备启动一个Worker进程
    ///
    /// 结果通过 `results` 上报；所有Worker结束后该通道随代理一同关闭。
    pub fn spawn(
        &mut self,
        devices: &[DeviceId],
        queue: &TaskQueue,
        results: mpsc::UnboundedSender<TaskResult>,
    ) -> BatchResult<&[WorkerHandle]> {
        for &device in devices {
            let lane = queue.receiver(device).ok_or_else(|| BatchError::WorkerSpawn {
                device: device.to_string(),
                message: "设备没有对应的任务队列".to_string(),
            })?;
            let handle = self.spawn_one(device, lane, results.clone())?;
            self.workers.push(handle);
        }
        Ok(&self.workers)
    }

    fn spawn_one(
        &self,
        device: DeviceId,
        lane: Receiver<QueueItem>,
        results: mpsc::UnboundedSender<TaskResult>,
    ) -> BatchResult<WorkerHandle> {
        let spawn_error = |message: String| BatchError::WorkerSpawn {
            device: device.to_string(),
            message,
        };

        let mut child = self
            .launch
            .command(device, &self.output_dir)
            .spawn()
            .map_err(|e| spawn_error(format!("{}: {e}", self.launch.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("无法获取子进程stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("无法获取子进程stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error("无法获取子进程stderr".to_string()))?;

        let pid = child.id();
        info!(device = %device, pid = ?pid, "Worker 进程已启动: device={}, pid={:?}", device, pid);

        let (status_tx, _) = watch::channel(WorkerStatus::started(device, pid));
        let status = Arc::new(status_tx);
        let kill = CancellationToken::new();

        let proxy = WorkerProxy {
            device,
            lane,
            results,
            shutdown: self.shutdown.clone(),
            status: Arc::clone(&status),
        };

        let tasks = vec![
            tokio::spawn(watch_exit(device, child, kill.clone(), Arc::clone(&status))),
            tokio::spawn(relay_stderr(device, stderr)),
            tokio::spawn(proxy.run(stdin, stdout)),
        ];

        Ok(WorkerHandle {
            device,
            status,
            kill,
            tasks,
        })
    }

    /// 等待所有Worker进程退出
    ///
    /// 超时返回 `false`；所有进程按时退出且退出码均为0时返回 `true`。
    pub async fn await_completion(&self, timeout: Option<Duration>) -> bool {
        let all_exited = join_all(self.workers.iter().map(WorkerHandle::wait_exited));
        let exited_in_time = match timeout {
            Some(limit) => tokio::time::timeout(limit, all_exited).await.is_ok(),
            None => {
                all_exited.await;
                true
            }
        };

        if !exited_in_time {
            warn!("等待Worker进程退出超时: {:?}", timeout);
            return false;
        }
        self.workers
            .iter()
            .all(|w| w.status.borrow().exit_code == Some(0))
    }

    /// 发送停止信号，等待宽限期后强制终止仍存活的进程
    ///
    /// 返回被强制终止的进程数。
    pub async fn terminate_all(&self) -> usize {
        info!("停止所有Worker进程，宽限期 {:?}", self.grace_period);
        self.shutdown.cancel();

        if self.await_completion(Some(self.grace_period)).await {
            return 0;
        }

        let mut killed = 0;
        for worker in self.workers.iter().filter(|w| w.is_alive()) {
            warn!(device = %worker.device, "Worker 未在宽限期内退出，强制终止");
            worker.status.send_modify(|s| s.force_killed = true);
            worker.kill.cancel();
            killed += 1;
        }

        if killed > 0
            && tokio::time::timeout(
                EXIT_STATUS_WAIT,
                join_all(self.workers.iter().map(WorkerHandle::wait_exited)),
            )
            .await
            .is_err()
        {
            error!("强制终止后仍有Worker进程未退出");
        }
        killed
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(WorkerHandle::status).collect()
    }

    /// 等待所有代理与日志转发任务结束
    pub async fn join(&mut self) {
        let tasks = self
            .workers
            .iter_mut()
            .flat_map(|w| w.tasks.drain(..))
            .collect::<Vec<_>>();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Worker 监管任务异常结束: {}", e);
            }
        }
    }
}

async fn watch_exit(
    device: DeviceId,
    mut child: Child,
    kill: CancellationToken,
    status: Arc<watch::Sender<WorkerStatus>>,
) {
    let exit = tokio::select! {
        exit = child.wait() => exit,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                warn!(device = %device, "发送终止信号失败: {}", e);
            }
            child.wait().await
        }
    };

    let exit_code = match exit {
        Ok(exit_status) => exit_status.code(),
        Err(e) => {
            error!(device = %device, "等待Worker进程退出失败: {}", e);
            None
        }
    };

    if exit_code == Some(0) {
        info!(device = %device, "Worker 进程正常退出");
    } else {
        warn!(device = %device, exit_code = ?exit_code, "Worker 进程退出: device={}, code={:?}", device, exit_code);
    }

    status.send_modify(|s| {
        s.alive = false;
        s.exit_code = exit_code;
    });
}

async fn relay_stderr(device: DeviceId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => info!(target: "batch_worker::child", device = %device, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(device = %device, "读取Worker stderr失败: {}", e);
                break;
            }
        }
    }
}

/// 正在子进程中执行的任务
struct InFlight {
    task: Task,
    started: Instant,
    attempt: u32,
}

struct WorkerProxy {
    device: DeviceId,
    lane: Receiver<QueueItem>,
    results: mpsc::UnboundedSender<TaskResult>,
    shutdown: CancellationToken,
    status: Arc<watch::Sender<WorkerStatus>>,
}

impl WorkerProxy {
    async fn run(self, mut stdin: ChildStdin, stdout: ChildStdout) {
        let device = self.device;
        let mut events = BufReader::new(stdout).lines();
        let mut in_flight: Option<InFlight> = None;
        let mut shutdown_sent = false;

        loop {
            let line = tokio::select! {
                line = events.next_line() => line,
                _ = self.shutdown.cancelled(), if !shutdown_sent => {
                    self.send(&mut stdin, &WorkerCommand::Shutdown).await;
                    shutdown_sent = true;
                    continue;
                }
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!(device = %device, "读取Worker输出失败: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let event = match decode_line::<WorkerEvent>(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(device = %device, "忽略无法识别的Worker输出: {}", e);
                    continue;
                }
            };

            match event {
                WorkerEvent::Ready { .. } => {
                    if shutdown_sent {
                        continue;
                    }
                    match self.next_task().await {
                        Some(mut task) => {
                            task.transition(TaskState::Running);
                            debug!(device = %device, task_id = task.id, "派发任务: {}", task.file_name());
                            self.status.send_modify(|s| s.current_task = Some(task.id));
                            let command = WorkerCommand::Execute { task: task.clone() };
                            in_flight = Some(InFlight {
                                task,
                                started: Instant::now(),
                                attempt: 1,
                            });
                            self.send(&mut stdin, &command).await;
                        }
                        None => {
                            self.send(&mut stdin, &WorkerCommand::Shutdown).await;
                            shutdown_sent = true;
                        }
                    }
                }
                WorkerEvent::Started { task_id, attempt } => {
                    debug!(device = %device, task_id, attempt, "任务开始执行: 第 {} 次尝试", attempt);
                    if let Some(current) = in_flight.as_mut().filter(|c| c.task.id == task_id) {
                        current.attempt = attempt;
                    }
                }
                WorkerEvent::Retrying {
                    task_id,
                    attempt,
                    delay_ms,
                    error,
                } => {
                    warn!(
                        device = %device,
                        task_id,
                        attempt,
                        delay_ms,
                        "任务第 {} 次尝试失败，{}ms 后重试: {}",
                        attempt,
                        delay_ms,
                        error
                    );
                }
                WorkerEvent::Finished { result } => {
                    if in_flight.as_ref().map(|c| c.task.id) == Some(result.task_id) {
                        in_flight = None;
                    }
                    self.status.send_modify(|s| {
                        s.current_task = None;
                        s.tasks_finished += 1;
                    });
                    self.emit(result);
                }
                WorkerEvent::Fatal { error } => {
                    error!(device = %device, "Worker 报告致命错误: {}", error);
                }
            }
        }

        drop(stdin);

        if let Some(current) = in_flight {
            let exit_code = self.exit_code().await;
            let cause = if self.shutdown.is_cancelled() {
                BatchError::cancelled(format!(
                    "任务 {} 在设备 {} 上执行时被终止",
                    current.task.file_name(),
                    device
                ))
            } else {
                BatchError::WorkerCrash {
                    device: device.to_string(),
                    exit_code,
                }
            };
            error!(device = %device, task_id = current.task.id, "任务未完成: {}", cause);
            self.status.send_modify(|s| s.current_task = None);
            self.emit(TaskResult::failed(
                &current.task,
                current.started.elapsed().as_secs_f64(),
                current.attempt,
                cause.to_string(),
            ));
        }
        debug!(device = %device, "Worker 代理结束");
    }

    /// 从本设备的队列取下一个任务；哨兵、队列关闭或停止信号均返回 `None`
    async fn next_task(&self) -> Option<Task> {
        tokio::select! {
            item = self.lane.recv() => match item {
                Ok(QueueItem::Task(task)) => Some(task),
                Ok(QueueItem::Sentinel) | Err(_) => None,
            },
            _ = self.shutdown.cancelled() => None,
        }
    }

    async fn send(&self, stdin: &mut ChildStdin, command: &WorkerCommand) {
        let written = match encode_line(command) {
            Ok(line) => match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await.map_err(BatchError::from),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(device = %self.device, "向Worker发送指令失败: {}", e);
        }
    }

    fn emit(&self, result: TaskResult) {
        if self.results.send(result).is_err() {
            warn!(device = %self.device, "结果通道已关闭，丢弃任务结果");
        }
    }

    async fn exit_code(&self) -> Option<i32> {
        let mut rx = self.status.subscribe();
        match tokio::time::timeout(EXIT_STATUS_WAIT, rx.wait_for(|s| !s.alive)).await {
            Ok(Ok(status)) => status.exit_code,
            _ => None,
        }
    }
}
