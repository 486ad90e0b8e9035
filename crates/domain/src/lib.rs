pub mod device;
pub mod manifest;
pub mod metrics;
pub mod protocol;
pub mod result;
pub mod task;

pub use batch_errors::{BatchError, BatchResult};
pub use device::{Device, DeviceId, DeviceInfo};
pub use manifest::{BatchManifest, ManifestEntry};
pub use metrics::{DeviceStats, MetricsSnapshot};
pub use protocol::{WorkerCommand, WorkerEvent};
pub use result::{ProcessOutput, TaskResult};
pub use task::{Task, TaskId, TaskState};
