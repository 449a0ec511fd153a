//! 预约任务队列
//!
//! 外部生产者（事件计时器等）并发推入，调度器单线程弹出。
//! 队列始终按 `start_time` 升序；最近执行过的任务编号保留 50 个，最旧的先淘汰。

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local};

use crate::core::{Priority, RunState};
use crate::script::Variables;

/// 默认保留的已执行任务编号数量
pub const DEFAULT_EXECUTED_HISTORY: usize = 50;

/// 外部注入的一次性任务
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    /// 事件名称（例如 Boss 名），与 `spawn_time` 一起组成任务编号
    pub name: String,
    pub script: PathBuf,
    pub start_time: DateTime<Local>,
    /// 事件本身的发生时间（原样字符串）
    pub spawn_time: String,
    pub priority: Priority,
    pub variables: Variables,
}

impl ScheduledTask {
    pub fn new(
        name: impl Into<String>,
        script: impl Into<PathBuf>,
        start_time: DateTime<Local>,
        priority: Priority,
    ) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            start_time,
            spawn_time: String::new(),
            priority,
            variables: Variables::new(),
        }
    }

    pub fn spawned_at(mut self, spawn_time: impl Into<String>) -> Self {
        self.spawn_time = spawn_time.into();
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// 去重键：`name|spawn_time`
    pub fn mission_id(&self) -> String {
        format!("{}|{}", self.name, self.spawn_time)
    }

    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        self.start_time <= now
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<ScheduledTask>,
    executed_order: VecDeque<String>,
    executed: HashSet<String>,
}

/// 推入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DuplicatePending,
    AlreadyExecuted,
}

#[derive(Debug)]
pub struct ScheduleQueue {
    state: Mutex<QueueState>,
    history: usize,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_EXECUTED_HISTORY)
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            history: history.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // 纯数据，中毒后照常使用
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 推入任务；同编号的任务已在队列中或已执行过时拒绝
    pub fn push(&self, task: ScheduledTask) -> PushOutcome {
        let id = task.mission_id();
        let mut state = self.lock();
        if state.executed.contains(&id) {
            tracing::debug!(mission = %id, "Mission already executed, ignoring");
            return PushOutcome::AlreadyExecuted;
        }
        if state.pending.iter().any(|t| t.mission_id() == id) {
            tracing::debug!(mission = %id, "Mission already queued, ignoring");
            return PushOutcome::DuplicatePending;
        }

        let at = state
            .pending
            .partition_point(|t| t.start_time <= task.start_time);
        tracing::info!(
            mission = %id,
            priority = task.priority.label(),
            start = %task.start_time.format("%H:%M:%S"),
            "Scheduled task queued"
        );
        state.pending.insert(at, task);
        PushOutcome::Queued
    }

    /// 弹出已到期的队首任务
    pub fn pop_due(&self, now: DateTime<Local>) -> Option<ScheduledTask> {
        let mut state = self.lock();
        match state.pending.first() {
            Some(head) if head.is_due(now) => Some(state.pending.remove(0)),
            _ => None,
        }
    }

    /// 标记为已执行；之前执行过则返回 false
    pub fn mark_executed(&self, mission_id: &str) -> bool {
        let mut state = self.lock();
        if !state.executed.insert(mission_id.to_string()) {
            return false;
        }
        state.executed_order.push_back(mission_id.to_string());
        while state.executed_order.len() > self.history {
            if let Some(oldest) = state.executed_order.pop_front() {
                state.executed.remove(&oldest);
            }
        }
        true
    }

    /// 队首已到期且优先级严格高于当前运行的任务时返回其优先级
    pub fn due_preemptor(&self, now: DateTime<Local>, run_state: &RunState) -> Option<Priority> {
        let state = self.lock();
        state
            .pending
            .first()
            .filter(|head| head.is_due(now) && run_state.is_outranked_by(head.priority))
            .map(|head| head.priority)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn pending(&self) -> Vec<ScheduledTask> {
        self.lock().pending.clone()
    }
}

impl Default for ScheduleQueue {
    fn default() -> Self {
        Self::new()
    }
}
