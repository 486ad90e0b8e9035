use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

pub type TaskId = u64;

/// 任务状态机: Pending → Running → {Succeeded | Retrying → Running | Failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Running)
                // 取消时排队中或退避中的任务直接记为失败
                | (Pending, Failed)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// 一个输入文件对应一个任务，生命周期内只归属一个设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub input_path: PathBuf,
    pub assigned_device: DeviceId,
    pub size_bytes: u64,
    pub state: TaskState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, input_path: PathBuf, assigned_device: DeviceId, size_bytes: u64) -> Self {
        Self {
            id,
            input_path,
            assigned_device,
            size_bytes,
            state: TaskState::Pending,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// 状态迁移，非法迁移返回 false 且不修改状态
    pub fn transition(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        if next == TaskState::Running {
            self.attempt_count += 1;
        }
        self.state = next;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let moved = self.transition(TaskState::Failed);
        if moved {
            self.last_error = Some(error.into());
        }
        moved
    }

    pub fn file_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input_path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(1, PathBuf::from("/audio/a.wav"), DeviceId::Gpu(0), 1024)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = task();
        assert_eq!(t.state, TaskState::Pending);
        assert!(t.transition(TaskState::Running));
        assert!(t.transition(TaskState::Succeeded));
        assert!(t.state.is_terminal());
        assert_eq!(t.attempt_count, 1);
    }

    #[test]
    fn test_retry_transitions_count_attempts() {
        let mut t = task();
        assert!(t.transition(TaskState::Running));
        assert!(t.transition(TaskState::Retrying));
        assert!(t.transition(TaskState::Running));
        assert!(t.fail("decode failed"));
        assert_eq!(t.attempt_count, 2);
        assert_eq!(t.state, TaskState::Failed);
        assert_eq!(t.last_error.as_deref(), Some("decode failed"));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut t = task();
        assert!(!t.transition(TaskState::Succeeded));
        assert!(!t.transition(TaskState::Retrying));

        t.transition(TaskState::Running);
        t.transition(TaskState::Succeeded);
        assert!(!t.transition(TaskState::Running));
        assert!(!t.fail("late"));
        assert_eq!(t.state, TaskState::Succeeded);
        assert!(t.last_error.is_none());
    }

    #[test]
    fn test_file_name() {
        assert_eq!(task().file_name(), "a.wav");
    }
}
