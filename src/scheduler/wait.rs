//! 可取消等待：引擎里唯一的挂起点
//!
//! 每个 tick（默认 50ms）检查两件事：
//! - 停止 token 被取消 → `Interrupt::Stop`，调用方必须一路退出
//! - 队首预约任务已到期且优先级更高 → `Interrupt::Preempt`，只中止当前脚本
//!
//! 超过 2 秒的等待会不时轻推一下光标（微动 ±5px 为主，偶尔漂移 ±20px），只为看起来像人。

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use rand::Rng;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::actuator::Actuator;
use crate::core::{Interrupt, RunState};
use crate::observability::Journal;
use crate::scheduler::queue::ScheduleQueue;

pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// 超过这个时长的等待才会有空闲小动作
const IDLE_MOTION_AFTER: Duration = Duration::from_secs(2);

/// 单次等待的上限，更长的请求会被截断
pub const MAX_SLEEP: Duration = Duration::from_secs(86_400);

#[derive(Clone)]
pub struct Waiter {
    stop: CancellationToken,
    queue: Arc<ScheduleQueue>,
    run_state: Arc<RunState>,
    journal: Journal,
    idle_actuator: Option<Arc<Actuator>>,
    tick: Duration,
}

impl Waiter {
    pub fn new(
        stop: CancellationToken,
        queue: Arc<ScheduleQueue>,
        run_state: Arc<RunState>,
        journal: Journal,
    ) -> Self {
        Self {
            stop,
            queue,
            run_state,
            journal,
            idle_actuator: None,
            tick: DEFAULT_TICK,
        }
    }

    /// 长等待期间用这个执行器做空闲小动作
    pub fn with_idle_motion(mut self, actuator: Arc<Actuator>) -> Self {
        self.idle_actuator = Some(actuator);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        if !tick.is_zero() {
            self.tick = tick;
        }
        self
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    pub fn queue(&self) -> &Arc<ScheduleQueue> {
        &self.queue
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn should_stop(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// 不等待，只检查一次中断条件
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.stop.is_cancelled() {
            return Err(Interrupt::Stop);
        }
        if let Some(priority) = self.queue.due_preemptor(Local::now(), &self.run_state) {
            let running = self
                .run_state
                .current()
                .map(|p| p.label())
                .unwrap_or("Idle");
            self.journal.warn(format!(
                "{} priority task is due, preempting {} work",
                priority.label(),
                running
            ));
            return Err(Interrupt::Preempt);
        }
        Ok(())
    }

    /// 按秒等待；非有限值记警告后跳过，不视为中断
    pub async fn sleep_secs(&self, secs: f64) -> Result<(), Interrupt> {
        if secs.is_nan() || secs <= 0.0 {
            return Ok(());
        }
        match Duration::try_from_secs_f64(secs.min(MAX_SLEEP.as_secs_f64())) {
            Ok(duration) => self.sleep(duration).await,
            Err(e) => {
                self.journal.warn(format!("Skipping wait of {secs}s: {e}"));
                Ok(())
            }
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        if duration > MAX_SLEEP {
            self.journal.warn(format!(
                "Wait of {}s capped at {}s",
                duration.as_secs(),
                MAX_SLEEP.as_secs()
            ));
        }
        let duration = duration.min(MAX_SLEEP);
        let started = Instant::now();
        let deadline = started + duration;
        let mut next_motion = (duration > IDLE_MOTION_AFTER && self.idle_actuator.is_some())
            .then(|| started + secs(rand::thread_rng().gen_range(2.0..=5.0)));

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.check()?;

            if let Some(at) = next_motion {
                if now >= at {
                    self.idle_motion().await;
                    next_motion = Some(Instant::now() + secs(rand::thread_rng().gen_range(3.0..=8.0)));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = self.stop.cancelled() => return Err(Interrupt::Stop),
                _ = sleep(remaining.min(self.tick)) => {}
            }
        }
    }

    async fn idle_motion(&self) {
        let Some(actuator) = &self.idle_actuator else {
            return;
        };
        // 四分之三微动，四分之一漂移
        let reach = if rand::thread_rng().gen_bool(0.75) { 5 } else { 20 };
        if let Err(e) = actuator.nudge(reach).await {
            tracing::debug!("Idle motion skipped: {}", e);
        }
    }
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{PositionSensor, VirtualCursor};
    use crate::core::Priority;
    use crate::fatigue::FatigueModel;
    use crate::geometry::{Point, Screen};
    use crate::scheduler::queue::ScheduledTask;

    fn waiter() -> Waiter {
        Waiter::new(
            CancellationToken::new(),
            Arc::new(ScheduleQueue::new()),
            Arc::new(RunState::new()),
            Journal::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion() {
        let waiter = waiter();
        let started = Instant::now();
        assert_eq!(waiter.sleep(Duration::from_millis(730)).await, Ok(()));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(730));
        assert!(elapsed < Duration::from_millis(790));
        assert_eq!(waiter.sleep_secs(0.0).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_waits_do_not_panic() {
        let waiter = waiter();
        let started = Instant::now();
        assert_eq!(waiter.sleep_secs(f64::INFINITY).await, Ok(()));
        assert_eq!(waiter.sleep_secs(f64::NAN).await, Ok(()));
        assert_eq!(started.elapsed(), Duration::ZERO);

        assert_eq!(waiter.sleep_secs(1e20).await, Ok(()));
        let elapsed = started.elapsed();
        assert!(elapsed >= MAX_SLEEP && elapsed < MAX_SLEEP + Duration::from_secs(1));

        let started = Instant::now();
        assert_eq!(waiter.sleep(Duration::MAX).await, Ok(()));
        assert!(started.elapsed() < MAX_SLEEP + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_promptly() {
        let waiter = waiter();
        let token = waiter.stop_token().clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(120)).await;
            token.cancel();
        });
        let started = Instant::now();
        assert_eq!(waiter.sleep(Duration::from_secs(30)).await, Err(Interrupt::Stop));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_higher_priority_preempts_within_one_tick() {
        let waiter = waiter();
        waiter.run_state().enter(Priority::Low);
        waiter.queue().push(ScheduledTask::new(
            "dragon",
            "boss.json",
            Local::now() - chrono::Duration::seconds(1),
            Priority::High,
        ));
        let started = Instant::now();
        assert_eq!(
            waiter.sleep(Duration::from_secs(10)).await,
            Err(Interrupt::Preempt)
        );
        assert!(started.elapsed() <= DEFAULT_TICK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_priority_does_not_preempt() {
        let waiter = waiter();
        waiter.run_state().enter(Priority::High);
        waiter.queue().push(ScheduledTask::new(
            "dragon",
            "boss.json",
            Local::now() - chrono::Duration::seconds(1),
            Priority::High,
        ));
        assert_eq!(waiter.sleep(Duration::from_millis(300)).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_wait_performs_idle_motion() {
        let screen = Screen::new(1920, 1080);
        let cursor = Arc::new(VirtualCursor::new(screen, Point::new(900, 500)));
        let actuator = Arc::new(Actuator::new(
            cursor.clone(),
            cursor.clone(),
            screen,
            Arc::new(FatigueModel::default()),
            Journal::default(),
        ));
        let waiter = waiter().with_idle_motion(actuator);

        waiter.sleep(Duration::from_secs(20)).await.unwrap();
        assert!(cursor.flushes() >= 2, "expected idle moves, got {}", cursor.flushes());
        assert!(cursor.position().distance(Point::new(900, 500)) < 200.0);

        cursor.clear_commands();
        let before = cursor.flushes();
        waiter.sleep(Duration::from_millis(1_500)).await.unwrap();
        assert_eq!(cursor.flushes(), before);
    }
}
