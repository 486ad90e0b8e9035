use std::collections::BTreeMap;

use async_channel::{Receiver, Sender};
use batch_domain::{DeviceId, Task};
use batch_errors::{BatchError, BatchResult};
use tracing::debug;

/// 队列中的元素：任务或"没有更多工作"哨兵
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Task(Task),
    Sentinel,
}

#[derive(Debug, Clone)]
struct Lane {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
}

/// 按设备分道的任务队列
///
/// 每个设备一条FIFO通道，任务只进入其 `assigned_device` 的通道，
/// 因此任务在整个运行期间只属于一个设备。`close()` 为每条通道追加一个哨兵。
#[derive(Debug, Clone)]
pub struct TaskQueue {
    lanes: BTreeMap<DeviceId, Lane>,
}

impl TaskQueue {
    pub fn new(devices: &[DeviceId]) -> Self {
        let lanes = devices
            .iter()
            .map(|device| {
                let (tx, rx) = async_channel::unbounded();
                (*device, Lane { tx, rx })
            })
            .collect();
        Self { lanes }
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.lanes.keys().copied().collect()
    }

    pub fn push(&self, task: Task) -> BatchResult<()> {
        let lane = self.lanes.get(&task.assigned_device).ok_or_else(|| {
            BatchError::Internal(format!(
                "任务 {} 指派的设备 {} 没有对应的队列",
                task.id, task.assigned_device
            ))
        })?;
        lane.tx
            .try_send(QueueItem::Task(task))
            .map_err(|e| BatchError::Internal(format!("任务入队失败: {e}")))
    }

    /// 每条通道追加一个哨兵，通知该设备的消费者没有更多工作
    pub fn close(&self) -> BatchResult<()> {
        for (device, lane) in &self.lanes {
            lane.tx
                .try_send(QueueItem::Sentinel)
                .map_err(|e| BatchError::Internal(format!("设备 {device} 哨兵入队失败: {e}")))?;
        }
        Ok(())
    }

    pub fn receiver(&self, device: DeviceId) -> Option<Receiver<QueueItem>> {
        self.lanes.get(&device).map(|lane| lane.rx.clone())
    }

    /// 队列中元素数（含哨兵）
    pub fn len(&self) -> usize {
        self.lanes.values().map(|lane| lane.rx.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取出所有未被消费的任务（丢弃哨兵）
    pub fn drain_remaining(&self) -> Vec<Task> {
        let mut remaining = Vec::new();
        for (device, lane) in &self.lanes {
            let mut count = 0;
            while let Ok(item) = lane.rx.try_recv() {
                if let QueueItem::Task(task) = item {
                    remaining.push(task);
                    count += 1;
                }
            }
            if count > 0 {
                debug!(device = %device, "设备 {} 队列中剩余 {} 个未处理任务", device, count);
            }
        }
        remaining
    }
}
