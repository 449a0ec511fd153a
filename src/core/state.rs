//! 运行状态：任务优先级与当前执行优先级
//!
//! `RunState` 只用于插队比较：可取消等待读取它，调度器在开始 / 结束任务时写入它。

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// 任务优先级：数值越小越优先
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub fn label(self) -> &'static str {
        match self {
            Priority::High => "High",
            Priority::Normal => "Normal",
            Priority::Low => "Low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Priority::High),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::Low),
            other => Err(format!("priority must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

const IDLE: u8 = u8::MAX;

/// 当前正在执行的脚本优先级；空闲时为哨兵值
#[derive(Debug)]
pub struct RunState {
    current: AtomicU8,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            current: AtomicU8::new(IDLE),
        }
    }

    pub fn enter(&self, priority: Priority) {
        self.current.store(priority.into(), Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.current.store(IDLE, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<Priority> {
        Priority::try_from(self.current.load(Ordering::SeqCst)).ok()
    }

    /// `candidate` 是否严格优先于当前运行的任务（空闲时任何任务都优先）
    pub fn is_outranked_by(&self, candidate: Priority) -> bool {
        u8::from(candidate) < self.current.load(Ordering::SeqCst)
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
