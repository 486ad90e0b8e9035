pub mod executors;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod supervisor;

pub use executors::{ShellProcessor, TaskProcessor};
pub use queue::{QueueItem, TaskQueue};
pub use retry::{RetryPolicy, Retryable};
pub use runtime::WorkerRuntime;
pub use supervisor::{WorkerHandle, WorkerLaunch, WorkerStatus, WorkerSupervisor};
