//! 可观测性：tracing 初始化与面向 GUI 的单向通知
//!
//! 每条日志同时写入 tracing 与广播通道；GUI（编辑器、叠加层）只订阅通道，从不回调引擎。

use tokio::sync::broadcast;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::geometry::{Point, Region};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// 日志结果标记
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Info,
    Warning,
    Error,
}

/// 引擎发往前端的通知
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Log { outcome: Outcome, message: String },
    /// 正在搜索的区域（叠加层画框）
    DrawRegion(Region),
    /// 即将点击的目标点
    DrawTarget(Point),
    /// 规划好的移动路径
    Path(Vec<Point>),
}

/// 日志与通知出口；克隆后共享同一个广播通道
#[derive(Debug, Clone)]
pub struct Journal {
    tx: broadcast::Sender<EngineEvent>,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(Outcome::Success, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Outcome::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Outcome::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Outcome::Error, message.into());
    }

    pub fn log(&self, outcome: Outcome, message: String) {
        match outcome {
            Outcome::Success | Outcome::Info => tracing::info!(?outcome, "{}", message),
            Outcome::Warning => tracing::warn!("{}", message),
            Outcome::Error => tracing::error!("{}", message),
        }
        // 没有订阅者时发送失败是正常的
        let _ = self.tx.send(EngineEvent::Log { outcome, message });
    }

    pub fn draw_region(&self, region: Region) {
        let _ = self.tx.send(EngineEvent::DrawRegion(region));
    }

    pub fn draw_target(&self, point: Point) {
        let _ = self.tx.send(EngineEvent::DrawTarget(point));
    }

    pub fn path(&self, waypoints: &[Point]) {
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(EngineEvent::Path(waypoints.to_vec()));
        }
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(256)
    }
}
