use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use batch_domain::{DeviceId, DeviceStats, MetricsSnapshot, TaskResult};
use comfy_table::{presets::UTF8_FULL, Cell, CellAlignment, ContentArrangement, Table};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 单个结果到达时传给回调的进度信息
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate<'a> {
    pub completed: usize,
    pub total: usize,
    pub result: &'a TaskResult,
}

impl ProgressUpdate<'_> {
    /// 形如 `[3/10] device 1: a.wav (RTF 0.120)` 的进度行
    pub fn line(&self) -> String {
        let result = self.result;
        if result.success {
            let rtf = result
                .rtf()
                .map(|rtf| format!("RTF {rtf:.3}"))
                .unwrap_or_else(|| format!("{:.2}s", result.duration_seconds));
            format!(
                "[{}/{}] device {}: {} ({})",
                self.completed,
                self.total,
                result.device_id,
                result.file_name(),
                rtf
            )
        } else {
            format!(
                "[{}/{}] device {}: FAILED {} - {}",
                self.completed,
                self.total,
                result.device_id,
                result.file_name(),
                result.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub input_path: PathBuf,
    pub device: DeviceId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStats {
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_audio_seconds: f64,
    pub total_processing_seconds: f64,
    pub rtf: f64,
    pub speedup: f64,
    pub wall_time_seconds: f64,
    pub per_device: BTreeMap<DeviceId, DeviceStats>,
    pub failures: Vec<FailureRecord>,
}

/// 结果流的唯一消费者，汇总各设备与整体指标
pub struct ProgressAggregator {
    per_device: BTreeMap<DeviceId, DeviceStats>,
    results: Vec<TaskResult>,
    failures: Vec<FailureRecord>,
    total_audio_seconds: f64,
    total_processing_seconds: f64,
    started_at: Instant,
    wall_time: Option<Duration>,
}

impl ProgressAggregator {
    pub fn new(devices: &[DeviceId]) -> Self {
        Self {
            per_device: devices
                .iter()
                .map(|d| (*d, DeviceStats::default()))
                .collect(),
            results: Vec::new(),
            failures: Vec::new(),
            total_audio_seconds: 0.0,
            total_processing_seconds: 0.0,
            started_at: Instant::now(),
            wall_time: None,
        }
    }

    /// 消费结果直到收到 `total_tasks` 个或通道关闭
    ///
    /// 可在超时或取消后再次调用以继续消费；返回本次调用收到的结果。
    pub async fn monitor<F>(
        &mut self,
        results: &mut UnboundedReceiver<TaskResult>,
        total_tasks: usize,
        mut on_progress: F,
    ) -> Vec<TaskResult>
    where
        F: FnMut(&ProgressUpdate<'_>),
    {
        let mut observed = Vec::new();
        while self.completed() < total_tasks {
            let Some(result) = results.recv().await else {
                debug!("结果通道已关闭");
                break;
            };
            self.record(result.clone());
            on_progress(&ProgressUpdate {
                completed: self.completed(),
                total: total_tasks,
                result: &result,
            });
            observed.push(result);
        }
        observed
    }

    pub fn record(&mut self, result: TaskResult) {
        let stats = self.per_device.entry(result.device_id).or_default();
        stats.time_spent += result.duration_seconds;

        if result.success {
            stats.files_done += 1;
            stats.bytes_processed += result.input_bytes;
            self.total_processing_seconds += result.duration_seconds;
            if let Some(audio) = result.audio_duration_seconds {
                stats.audio_seconds += audio;
                self.total_audio_seconds += audio;
            }
        } else {
            stats.failed += 1;
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            warn!(
                device = %result.device_id,
                task_id = result.task_id,
                "任务失败: {} - {}",
                result.file_name(),
                error
            );
            self.failures.push(FailureRecord {
                input_path: result.input_path.clone(),
                device: result.device_id,
                error,
            });
        }
        self.results.push(result);
    }

    pub fn completed(&self) -> usize {
        self.results.len()
    }

    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    pub fn results(&self) -> &[TaskResult] {
        &self.results
    }

    /// 固定总耗时，之后的 `speedup` 不再随时间变化
    pub fn finish(&mut self) {
        if self.wall_time.is_none() {
            self.wall_time = Some(self.started_at.elapsed());
        }
    }

    pub fn set_wall_time(&mut self, wall_time: Duration) {
        self.wall_time = Some(wall_time);
    }

    pub fn wall_time(&self) -> Duration {
        self.wall_time.unwrap_or_else(|| self.started_at.elapsed())
    }

    /// 处理耗时之和 / 音频时长之和；没有音频时长数据时为0
    pub fn rtf(&self) -> f64 {
        if self.total_audio_seconds > 0.0 {
            self.total_processing_seconds / self.total_audio_seconds
        } else {
            0.0
        }
    }

    /// 各设备耗时之和 / 实际总耗时
    pub fn speedup(&self) -> f64 {
        let wall = self.wall_time().as_secs_f64();
        if wall <= 0.0 {
            return 0.0;
        }
        self.per_device.values().map(|s| s.time_spent).sum::<f64>() / wall
    }

    pub fn per_device_stats(&self) -> &BTreeMap<DeviceId, DeviceStats> {
        &self.per_device
    }

    pub fn exit_code(&self) -> i32 {
        if self.failures.is_empty() {
            0
        } else {
            1
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            per_device: self.per_device.clone(),
            rtf: self.rtf(),
            speedup: self.speedup(),
            wall_time_seconds: self.wall_time().as_secs_f64(),
        }
    }

    pub fn summary_stats(&self) -> SummaryStats {
        SummaryStats {
            completed: self.completed(),
            successful: self.successful(),
            failed: self.failures.len(),
            total_audio_seconds: self.total_audio_seconds,
            total_processing_seconds: self.total_processing_seconds,
            rtf: self.rtf(),
            speedup: self.speedup(),
            wall_time_seconds: self.wall_time().as_secs_f64(),
            per_device: self.per_device.clone(),
            failures: self.failures.clone(),
        }
    }

    /// 人类可读的汇总：各设备表格、整体指标与失败文件列表
    pub fn summary(&self) -> String {
        let stats = self.summary_stats();

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                "Device", "Done", "Failed", "Time (s)", "Files/min", "Data (MB)", "RTF",
            ]);

        for (device, device_stats) in &stats.per_device {
            let throughput = if device_stats.time_spent > 0.0 {
                device_stats.files_total() as f64 / device_stats.time_spent * 60.0
            } else {
                0.0
            };
            table.add_row(vec![
                Cell::new(device.to_string()),
                Cell::new(device_stats.files_done).set_alignment(CellAlignment::Right),
                Cell::new(device_stats.failed).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2}", device_stats.time_spent))
                    .set_alignment(CellAlignment::Right),
                Cell::new(format!("{throughput:.2}")).set_alignment(CellAlignment::Right),
                Cell::new(format!(
                    "{:.2}",
                    device_stats.bytes_processed as f64 / (1024.0 * 1024.0)
                ))
                .set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3}", device_stats.rtf())).set_alignment(CellAlignment::Right),
            ]);
        }

        let mut out = String::new();
        out.push_str("\n=== Summary ===\n");
        out.push_str(&format!("Completed: {}\n", stats.completed));
        out.push_str(&format!("Successful: {}\n", stats.successful));
        out.push_str(&format!("Failed: {}\n", stats.failed));
        out.push_str(&format!(
            "Total audio duration: {:.2}s ({:.2}m)\n",
            stats.total_audio_seconds,
            stats.total_audio_seconds / 60.0
        ));
        out.push_str(&format!(
            "Total processing time: {:.2}s ({:.2}m)\n",
            stats.total_processing_seconds,
            stats.total_processing_seconds / 60.0
        ));
        out.push_str(&format!("Elapsed: {:.2}s\n", stats.wall_time_seconds));
        out.push_str(&format!("Overall RTF: {:.3}\n", stats.rtf));
        out.push_str(&format!("Speedup: {:.2}x\n", stats.speedup));
        out.push_str(&format!("\n{table}\n"));

        if !stats.failures.is_empty() {
            out.push_str("\n=== Failed Files ===\n");
            for failure in &stats.failures {
                out.push_str(&format!(
                    "  - {} (device {}): {}\n",
                    failure.input_path.display(),
                    failure.device,
                    failure.error
                ));
            }
        }
        out
    }

    pub fn log_summary(&self) {
        let stats = self.summary_stats();
        info!(
            completed = stats.completed,
            successful = stats.successful,
            failed = stats.failed,
            rtf = stats.rtf,
            speedup = stats.speedup,
            wall_time_seconds = stats.wall_time_seconds,
            "批处理完成: 成功 {}，失败 {}",
            stats.successful,
            stats.failed
        );
    }
}
