//! 运行统计与进度上报

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 单次运行的计数器，只增不减
#[derive(Debug, Default)]
pub struct Statistics {
    pub files_copied: AtomicU64,
    pub files_updated: AtomicU64,
    pub files_deleted: AtomicU64,
    pub files_skipped: AtomicU64,
    pub directories_created: AtomicU64,
    pub directories_deleted: AtomicU64,
    pub errors: AtomicU64,
    pub bytes_processed: AtomicU64,
}

impl Statistics {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatisticsSnapshot {
            files_copied: load(&self.files_copied),
            files_updated: load(&self.files_updated),
            files_deleted: load(&self.files_deleted),
            files_skipped: load(&self.files_skipped),
            directories_created: load(&self.directories_created),
            directories_deleted: load(&self.directories_deleted),
            errors: load(&self.errors),
            bytes_processed: load(&self.bytes_processed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub files_copied: u64,
    pub files_updated: u64,
    pub files_deleted: u64,
    pub files_skipped: u64,
    pub directories_created: u64,
    pub directories_deleted: u64,
    pub errors: u64,
    pub bytes_processed: u64,
}

impl StatisticsSnapshot {
    /// 已处理（成功或失败）的变更动作数
    pub fn changes(&self) -> u64 {
        self.files_copied
            + self.files_updated
            + self.files_deleted
            + self.directories_created
            + self.directories_deleted
    }
}

/// 进度事件。percent 为 -1 表示只是一条提示信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub message: String,
    pub percent: f64,
    /// 字节/秒
    pub speed: u64,
    /// 预计剩余秒数
    pub eta: u64,
}

impl ProgressUpdate {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            percent: -1.0,
            speed: 0,
            eta: 0,
        }
    }

    pub fn is_info(&self) -> bool {
        self.percent < 0.0
    }
}

/// 进度发送端。接收端关闭后发送静默失败
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<ProgressUpdate>>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub async fn send(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(update).await;
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.send(ProgressUpdate::info(message)).await;
    }

    /// 每 500ms 根据统计计算一次速度和剩余时间，直到 token 触发
    pub fn spawn_ticker(
        &self,
        stats: Arc<Statistics>,
        total_bytes: u64,
        total_actions: u64,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut last_bytes = 0u64;
            let mut last_time = Instant::now();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }

                let snap = stats.snapshot();
                let now = Instant::now();
                let elapsed = now.duration_since(last_time).as_secs_f64();
                let speed = if elapsed > 0.0 {
                    (snap.bytes_processed.saturating_sub(last_bytes) as f64 / elapsed) as u64
                } else {
                    0
                };
                last_bytes = snap.bytes_processed;
                last_time = now;

                let remaining = total_bytes.saturating_sub(snap.bytes_processed);
                let eta = if speed > 0 { remaining / speed } else { 0 };
                let done = snap.changes() + snap.errors;
                let percent = if total_bytes > 0 {
                    snap.bytes_processed.min(total_bytes) as f64 * 100.0 / total_bytes as f64
                } else if total_actions > 0 {
                    done.min(total_actions) as f64 * 100.0 / total_actions as f64
                } else {
                    100.0
                };

                reporter
                    .send(ProgressUpdate {
                        message: format!("同步中 {}/{}", done, total_actions),
                        percent,
                        speed,
                        eta,
                    })
                    .await;
            }
        })
    }
}

/// 滑动速度估计：至少间隔 1 秒才更新一次
#[derive(Debug)]
pub struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    speed: u64,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            speed: 0,
        }
    }

    /// 记录写入的字节，返回更新后的速度（如果本次更新了）
    pub fn record(&mut self, bytes: u64) -> Option<u64> {
        self.window_bytes += bytes;
        self.tick()
    }

    /// 不写入时也推进时间，让速度自然衰减
    pub fn tick(&mut self) -> Option<u64> {
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        self.speed = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
        self.window_bytes = 0;
        self.window_start = Instant::now();
        Some(self.speed)
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }

    /// 当前窗口的即时速度，窗口不满 1 秒也能估计
    pub fn current(&self) -> u64 {
        let elapsed = self.window_start.elapsed().max(Duration::from_millis(10));
        (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let stats = Statistics::default();
        Statistics::incr(&stats.files_copied);
        Statistics::incr(&stats.files_skipped);
        Statistics::add(&stats.bytes_processed, 42);
        let snap = stats.snapshot();
        assert_eq!(snap.files_copied, 1);
        assert_eq!(snap.files_skipped, 1);
        assert_eq!(snap.bytes_processed, 42);
        assert_eq!(snap.changes(), 1);
    }

    #[test]
    fn test_snapshot_json_names() {
        let json = serde_json::to_value(StatisticsSnapshot::default()).unwrap();
        assert!(json.get("filesCopied").is_some());
        assert!(json.get("directoriesDeleted").is_some());
        assert!(json.get("bytesProcessed").is_some());
    }

    #[tokio::test]
    async fn test_reporter_sends_info() {
        let (tx, mut rx) = mpsc::channel(4);
        let reporter = ProgressReporter::new(tx);
        reporter.info("扫描中").await;
        let update = rx.recv().await.unwrap();
        assert!(update.is_info());
        assert_eq!(update.message, "扫描中");

        // 未启用时不报错
        ProgressReporter::disabled().info("x").await;
    }

    #[tokio::test]
    async fn test_ticker_reports_percent() {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Arc::new(Statistics::default());
        Statistics::add(&stats.bytes_processed, 50);
        let stop = CancellationToken::new();
        let handle = ProgressReporter::new(tx).spawn_ticker(stats, 100, 2, stop.clone());

        let update = rx.recv().await.unwrap();
        assert_eq!(update.percent, 50.0);
        stop.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_speed_meter_waits_a_second() {
        let mut meter = SpeedMeter::new();
        assert_eq!(meter.record(100), None);
        assert_eq!(meter.speed(), 0);
        // 即时速度不用等窗口结束
        assert!(meter.current() > 0);
    }
}
