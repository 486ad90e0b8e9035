//! 批处理调度
//!
//! 设备检测、工作负载分配、进度汇总以及把它们串起来的 [`Orchestrator`]。

pub mod allocator;
pub mod device_detector;
pub mod manifest;
pub mod orchestrator;
pub mod progress;

pub use allocator::{DistributionStats, InputFile, Partition, WorkPlan, WorkloadAllocator, WorkloadEstimate};
pub use device_detector::{DeviceDetector, DeviceProbe, NvidiaSmiProbe, StaticProbe};
pub use manifest::ManifestStore;
pub use orchestrator::{DeviceReport, Orchestrator, RunOutcome, RunReport, RunRequest, RunState, WorkloadInfo};
pub use progress::{FailureRecord, ProgressAggregator, ProgressUpdate, SummaryStats};
