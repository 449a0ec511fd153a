//! 看门狗：画面长时间静止时请求停止
//!
//! 每隔 `interval` 取一帧灰度采样，与上一帧求均方误差；低于阈值记一次"静止"，
//! 连续 `max_static_checks` 次即以 [`ShutdownReason::Watchdog`] 停止整个运行循环。
//! 采样失败直接忽略。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::core::{ShutdownManager, ShutdownReason};
use crate::observability::Journal;
use crate::perception::{Frame, Perception};

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub max_static_checks: u32,
    pub static_threshold: f64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_static_checks: 5,
            static_threshold: 50.0,
        }
    }
}

/// 单次采样的判定
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// 没有可比较的上一帧（首帧或尺寸变化）
    Baseline,
    Changed,
    /// 静止若干次后画面又动了
    Recovered,
    Static(u32),
    /// 达到上限，计数已清零
    Frozen,
}

/// 静止检测的纯状态机
#[derive(Debug)]
pub struct StaticMonitor {
    previous: Option<Frame>,
    static_count: u32,
    max_static_checks: u32,
    threshold: f64,
}

impl StaticMonitor {
    pub fn new(max_static_checks: u32, threshold: f64) -> Self {
        Self {
            previous: None,
            static_count: 0,
            max_static_checks: max_static_checks.max(1),
            threshold,
        }
    }

    pub fn static_count(&self) -> u32 {
        self.static_count
    }

    pub fn observe(&mut self, frame: Frame) -> Verdict {
        let mse = self.previous.as_ref().and_then(|prev| prev.mse(&frame));
        let verdict = match mse {
            None => Verdict::Baseline,
            Some(mse) if mse < self.threshold => {
                self.static_count += 1;
                if self.static_count >= self.max_static_checks {
                    self.static_count = 0;
                    Verdict::Frozen
                } else {
                    Verdict::Static(self.static_count)
                }
            }
            Some(_) => {
                let was_static = self.static_count > 0;
                self.static_count = 0;
                if was_static {
                    Verdict::Recovered
                } else {
                    Verdict::Changed
                }
            }
        };
        self.previous = Some(frame);
        verdict
    }
}

pub struct Watchdog {
    perception: Arc<dyn Perception>,
    shutdown: Arc<ShutdownManager>,
    journal: Journal,
    settings: WatchdogSettings,
}

impl Watchdog {
    pub fn new(
        perception: Arc<dyn Perception>,
        shutdown: Arc<ShutdownManager>,
        journal: Journal,
    ) -> Self {
        Self {
            perception,
            shutdown,
            journal,
            settings: WatchdogSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WatchdogSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 运行到停止信号为止
    pub async fn run(self) {
        let token = self.shutdown.token();
        let mut monitor =
            StaticMonitor::new(self.settings.max_static_checks, self.settings.static_threshold);
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            max_static_checks = self.settings.max_static_checks,
            "Watchdog started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }

            let frame = match self.perception.capture_sample().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("Watchdog capture skipped: {}", e);
                    continue;
                }
            };

            match monitor.observe(frame) {
                Verdict::Frozen => {
                    self.journal.error(format!(
                        "Screen static for {} checks, stopping",
                        self.settings.max_static_checks
                    ));
                    self.shutdown.shutdown(ShutdownReason::Watchdog);
                }
                Verdict::Static(count) => {
                    self.journal.warn(format!(
                        "Screen unchanged ({count}/{})",
                        self.settings.max_static_checks
                    ));
                }
                Verdict::Recovered => self.journal.info("Screen changed, watchdog reset"),
                Verdict::Baseline | Verdict::Changed => {}
            }
        }
        tracing::debug!("Watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::ScriptedPerception;

    fn flat(value: u8) -> Frame {
        Frame::new(4, 4, vec![value; 16])
    }

    #[test]
    fn test_monitor_counts_and_resets() {
        let mut monitor = StaticMonitor::new(3, 50.0);
        assert_eq!(monitor.observe(flat(10)), Verdict::Baseline);
        assert_eq!(monitor.observe(flat(12)), Verdict::Static(1));
        assert_eq!(monitor.observe(flat(10)), Verdict::Static(2));
        assert_eq!(monitor.observe(flat(200)), Verdict::Recovered);
        assert_eq!(monitor.static_count(), 0);
        assert_eq!(monitor.observe(flat(10)), Verdict::Changed);

        assert_eq!(monitor.observe(flat(10)), Verdict::Static(1));
        assert_eq!(monitor.observe(flat(10)), Verdict::Static(2));
        assert_eq!(monitor.observe(flat(10)), Verdict::Frozen);
        assert_eq!(monitor.static_count(), 0);

        // 尺寸变化无法比较
        assert_eq!(monitor.observe(Frame::new(2, 2, vec![10; 4])), Verdict::Baseline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_screen_requests_stop() {
        let perception = Arc::new(ScriptedPerception::new());
        perception.push_frame(flat(30));
        let shutdown = Arc::new(ShutdownManager::new());
        let mut reasons = shutdown.subscribe();

        let settings = WatchdogSettings {
            interval: Duration::from_secs(60),
            max_static_checks: 5,
            static_threshold: 50.0,
        };
        let handle = Watchdog::new(perception, shutdown.clone(), Journal::default())
            .with_settings(settings)
            .spawn();

        let started = tokio::time::Instant::now();
        shutdown.wait_for_shutdown().await;
        // 基准帧 + 5 次静止
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(360) && elapsed < Duration::from_secs(361));
        assert_eq!(reasons.recv().await.unwrap(), ShutdownReason::Watchdog);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failures_are_ignored() {
        let perception = Arc::new(ScriptedPerception::new());
        let shutdown = Arc::new(ShutdownManager::new());
        let handle = Watchdog::new(perception, shutdown.clone(), Journal::default()).spawn();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!shutdown.is_shutdown());

        shutdown.shutdown(ShutdownReason::UserInitiated);
        handle.await.unwrap();
    }
}
