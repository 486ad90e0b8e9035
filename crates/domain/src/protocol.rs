//! 父进程与Worker子进程之间的通信协议
//!
//! 通过子进程的 stdin/stdout 交换按行分隔的JSON消息。子进程的日志只写 stderr。

use batch_errors::{BatchError, BatchResult};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::result::TaskResult;
use crate::task::{Task, TaskId};

/// 子进程 → 父进程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// 空闲，请求下一个任务
    Ready { device: DeviceId },
    Started { task_id: TaskId, attempt: u32 },
    Retrying {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Finished { result: TaskResult },
    /// 子进程无法继续工作（例如处理器初始化失败），随后退出
    Fatal { error: String },
}

/// 父进程 → 子进程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Execute { task: Task },
    Shutdown,
}

pub fn encode_line<T: Serialize>(message: &T) -> BatchResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> BatchResult<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| BatchError::protocol(format!("无法解析消息 '{}': {e}", line.trim())))
}
