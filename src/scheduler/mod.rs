//! 调度器：周期任务 + 外部预约任务
//!
//! 每轮循环：
//! 1. 预约队列队首已到期 → 弹出、按任务编号去重、执行（总是优先于周期任务）
//! 2. 否则在符合条件的周期任务中选优先级数值最小的执行；没有则可取消地等待 1 秒重试
//! 3. 周期任务正常结束后更新记录，冷却 1–3 秒，并按疲劳模型决定是否小憩
//!
//! 被插队（`Interrupt::Preempt`）的任务不更新记录、不冷却，直接回到第 1 步；
//! 停止（`Interrupt::Stop`）则退出整个循环。

pub mod queue;
pub mod wait;

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use rand::Rng;

use crate::core::{Interrupt, Priority};
use crate::interpreter::{Interpreter, RunOutcome};
use crate::script::Variables;

pub use queue::{PushOutcome, ScheduleQueue, ScheduledTask, DEFAULT_EXECUTED_HISTORY};
pub use wait::{Waiter, DEFAULT_TICK, MAX_SLEEP};

/// 周期任务的触发方式
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMode {
    /// 距上次运行满 `every` 后可再次运行
    Interval { every: Duration },
    /// 每天在时间窗内成功运行一次
    DailyWindow { start: NaiveTime, end: NaiveTime },
}

#[derive(Debug, Clone)]
pub struct RecurringTask {
    pub script: PathBuf,
    pub priority: Priority,
    pub mode: TaskMode,
    pub last_run_at: Option<DateTime<Local>>,
    pub last_success_date: Option<NaiveDate>,
}

impl RecurringTask {
    pub fn new(script: impl Into<PathBuf>, priority: Priority, mode: TaskMode) -> Self {
        Self {
            script: script.into(),
            priority,
            mode,
            last_run_at: None,
            last_success_date: None,
        }
    }

    pub fn interval(script: impl Into<PathBuf>, priority: Priority, every: Duration) -> Self {
        Self::new(script, priority, TaskMode::Interval { every })
    }

    pub fn daily_window(
        script: impl Into<PathBuf>,
        priority: Priority,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Self {
        Self::new(script, priority, TaskMode::DailyWindow { start, end })
    }

    pub fn is_eligible(&self, now: DateTime<Local>) -> bool {
        match &self.mode {
            TaskMode::Interval { every } => match self.last_run_at {
                None => true,
                Some(last) => {
                    let elapsed = now.signed_duration_since(last).num_milliseconds();
                    elapsed >= 0 && elapsed as u128 >= every.as_millis()
                }
            },
            TaskMode::DailyWindow { start, end } => {
                let time = now.time();
                *start <= time && time <= *end && self.last_success_date != Some(now.date_naive())
            }
        }
    }

    /// 一次执行结束后的记录
    pub fn mark_done(&mut self, now: DateTime<Local>) {
        self.last_run_at = Some(now);
        if matches!(self.mode, TaskMode::DailyWindow { .. }) {
            self.last_success_date = Some(now.date_naive());
        }
    }

    pub fn name(&self) -> String {
        self.script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.script.display().to_string())
    }
}

/// 符合条件的周期任务里优先级最高（数值最小）的那个；并列取列表中靠前者
pub fn pick_recurring(tasks: &[RecurringTask], now: DateTime<Local>) -> Option<usize> {
    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_eligible(now))
        .min_by_key(|(_, t)| t.priority)
        .map(|(i, _)| i)
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// 周期任务之间的冷却秒数
    pub cooldown_secs: RangeInclusive<f64>,
    /// 无任务可做时的重试间隔
    pub idle_retry: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 1.0..=3.0,
            idle_retry: Duration::from_secs(1),
        }
    }
}

pub struct Scheduler {
    interpreter: Arc<Interpreter>,
    tasks: Vec<RecurringTask>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(interpreter: Arc<Interpreter>, tasks: Vec<RecurringTask>) -> Self {
        Self {
            interpreter,
            tasks,
            settings: SchedulerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tasks(&self) -> &[RecurringTask] {
        &self.tasks
    }

    fn waiter(&self) -> &Waiter {
        self.interpreter.engine().waiter()
    }

    /// 主循环，直到收到停止信号
    pub async fn run(&mut self) {
        let journal = self.interpreter.engine().journal().clone();
        journal.info(format!(
            "Scheduler started with {} recurring tasks",
            self.tasks.len()
        ));
        loop {
            match self.tick().await {
                Ok(()) | Err(Interrupt::Preempt) => {}
                Err(Interrupt::Stop) => {
                    journal.info("Scheduler stopped");
                    return;
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<(), Interrupt> {
        if self.waiter().should_stop() {
            return Err(Interrupt::Stop);
        }
        let now = Local::now();
        if let Some(task) = self.waiter().queue().pop_due(now) {
            return self.run_scheduled(task).await;
        }
        match pick_recurring(&self.tasks, now) {
            Some(index) => self.run_recurring(index).await,
            None => {
                let retry = self.settings.idle_retry;
                self.waiter().sleep(retry).await
            }
        }
    }

    async fn run_scheduled(&self, task: ScheduledTask) -> Result<(), Interrupt> {
        let journal = self.interpreter.engine().journal();
        let waiter = self.waiter();
        let mission = task.mission_id();
        if !waiter.queue().mark_executed(&mission) {
            journal.warn(format!("Mission {mission} already executed, skipping"));
            return Ok(());
        }

        journal.info(format!(
            "Running scheduled task {} ({} priority)",
            task.name,
            task.priority.label()
        ));
        waiter.run_state().enter(task.priority);
        let result = self
            .interpreter
            .run_file(&task.script, &task.variables)
            .await;
        waiter.run_state().leave();

        self.report(&task.name, result?);
        Ok(())
    }

    async fn run_recurring(&mut self, index: usize) -> Result<(), Interrupt> {
        let (name, script, priority) = {
            let task = &self.tasks[index];
            (task.name(), task.script.clone(), task.priority)
        };
        let engine = self.interpreter.engine().clone();
        let journal = engine.journal();
        let waiter = engine.waiter();

        journal.info(format!("Running {name} ({} priority)", priority.label()));
        waiter.run_state().enter(priority);
        let result = self.interpreter.run_file(&script, &Variables::new()).await;
        waiter.run_state().leave();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(Interrupt::Preempt) => {
                journal.warn(format!("{name} preempted, will resume later"));
                return Err(Interrupt::Preempt);
            }
            Err(Interrupt::Stop) => return Err(Interrupt::Stop),
        };
        self.report(&name, outcome);
        self.tasks[index].mark_done(Local::now());

        let cooldown = rand::thread_rng().gen_range(self.settings.cooldown_secs.clone());
        waiter.sleep_secs(cooldown).await?;

        if let Some(pause) = engine.actuator().fatigue().should_take_idle_break() {
            journal.info(format!(
                "Taking a {:.1}s break",
                pause.duration.as_secs_f64()
            ));
            waiter.sleep(pause.duration).await?;
        }
        Ok(())
    }

    fn report(&self, name: &str, outcome: RunOutcome) {
        let journal = self.interpreter.engine().journal();
        match outcome {
            RunOutcome::Completed => journal.success(format!("{name} finished")),
            RunOutcome::Halted => journal.warn(format!("{name} halted")),
            RunOutcome::Failed => journal.error(format!("{name} failed to run")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Actuator, ActuatorCommand, KeyCode, VirtualCursor};
    use crate::core::RunState;
    use crate::fatigue::FatigueModel;
    use crate::geometry::{Point, Screen};
    use crate::observability::Journal;
    use crate::perception::ScriptedPerception;
    use crate::plugins::{EngineHandle, PluginRegistry};
    use crate::script::{Script, StepRecord};
    use chrono::TimeZone;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 3, 14, h, m, 0)
            .single()
            .unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_interval_eligibility() {
        let mut task = RecurringTask::interval("farm.json", Priority::Normal, Duration::from_secs(600));
        assert!(task.is_eligible(at(10, 0)));
        task.mark_done(at(10, 0));
        assert!(!task.is_eligible(at(10, 9)));
        assert!(task.is_eligible(at(10, 10)));
        assert_eq!(task.last_success_date, None);
    }

    #[test]
    fn test_daily_window_eligibility() {
        let mut task = RecurringTask::daily_window("daily.json", Priority::Low, hm(9, 0), hm(12, 0));
        assert!(!task.is_eligible(at(8, 59)));
        assert!(task.is_eligible(at(9, 0)));
        assert!(task.is_eligible(at(12, 0)));
        assert!(!task.is_eligible(at(12, 1)));

        task.mark_done(at(10, 0));
        assert!(!task.is_eligible(at(11, 0)));
        let tomorrow = at(10, 0) + chrono::Duration::days(1);
        assert!(task.is_eligible(tomorrow));
    }

    #[test]
    fn test_pick_prefers_high_priority() {
        let mut done = RecurringTask::interval("a.json", Priority::High, Duration::from_secs(3600));
        done.mark_done(at(10, 0));
        let tasks = vec![
            RecurringTask::interval("low.json", Priority::Low, Duration::ZERO),
            done,
            RecurringTask::interval("normal.json", Priority::Normal, Duration::ZERO),
            RecurringTask::interval("normal2.json", Priority::Normal, Duration::ZERO),
        ];
        assert_eq!(pick_recurring(&tasks, at(10, 30)), Some(2));
        assert_eq!(pick_recurring(&tasks[..2], at(10, 30)), Some(0));
        assert_eq!(pick_recurring(&tasks[1..2], at(10, 30)), None);
    }

    struct Rig {
        cursor: Arc<VirtualCursor>,
        interpreter: Arc<Interpreter>,
        waiter: Waiter,
    }

    fn rig() -> Rig {
        let screen = Screen::new(1920, 1080);
        let journal = Journal::default();
        let cursor = Arc::new(VirtualCursor::new(screen, Point::new(500, 500)));
        let actuator = Arc::new(Actuator::new(
            cursor.clone(),
            cursor.clone(),
            screen,
            Arc::new(FatigueModel::default()),
            journal.clone(),
        ));
        let waiter = Waiter::new(
            CancellationToken::new(),
            Arc::new(ScheduleQueue::new()),
            Arc::new(RunState::new()),
            journal.clone(),
        );
        let engine = EngineHandle::new(
            actuator,
            Arc::new(ScriptedPerception::new()),
            journal,
            waiter.clone(),
        );
        Rig {
            cursor,
            interpreter: Arc::new(Interpreter::new(engine, Arc::new(PluginRegistry::new()))),
            waiter,
        }
    }

    async fn write_script(dir: &Path, name: &str, records: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        Script::new(records.iter().map(|(k, v)| StepRecord::new(*k, *v)).collect())
            .save(&path)
            .await
            .unwrap();
        path
    }

    fn stop_after(waiter: &Waiter, secs: u64) {
        let token = waiter.stop_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            token.cancel();
        });
    }

    fn downs(cursor: &VirtualCursor) -> Vec<u16> {
        cursor
            .commands()
            .iter()
            .filter_map(|c| match c {
                ActuatorCommand::Down(KeyCode(code)) => Some(*code),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_mission_runs_once() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "event.json", &[("Key", "70")]).await;
        let due = Local::now() - chrono::Duration::seconds(1);
        let task = || ScheduledTask::new("dragon", &script, due, Priority::High).spawned_at("12:00");

        assert_eq!(rig.waiter.queue().push(task()), PushOutcome::Queued);
        assert_eq!(rig.waiter.queue().push(task()), PushOutcome::DuplicatePending);

        stop_after(&rig.waiter, 5);
        Scheduler::new(rig.interpreter.clone(), Vec::new()).run().await;

        assert_eq!(downs(&rig.cursor), vec![70]);
        assert_eq!(rig.waiter.queue().push(task()), PushOutcome::AlreadyExecuted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_high_priority_preempts_recurring_low() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let routine = write_script(
            dir.path(),
            "routine.json",
            &[("Key", "65"), ("Wait", "30"), ("Key", "66")],
        )
        .await;
        let urgent = write_script(dir.path(), "urgent.json", &[("Key", "70")]).await;

        let queue = rig.waiter.queue().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            queue.push(ScheduledTask::new(
                "dragon",
                &urgent,
                Local::now() - chrono::Duration::seconds(1),
                Priority::High,
            ));
        });
        stop_after(&rig.waiter, 10);

        let tasks = vec![RecurringTask::interval(&routine, Priority::Low, Duration::from_secs(3600))];
        let mut scheduler = Scheduler::new(rig.interpreter.clone(), tasks);
        scheduler.run().await;

        // 例行任务被打断、紧急任务执行、例行任务从头再来
        assert_eq!(downs(&rig.cursor), vec![65, 70, 65]);
        // 被打断的那次不计入记录
        assert!(scheduler.tasks()[0].last_run_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_task_bookkeeping_and_cooldown() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let routine = write_script(dir.path(), "routine.json", &[("Key", "65")]).await;

        stop_after(&rig.waiter, 20);
        let tasks = vec![RecurringTask::interval(&routine, Priority::Normal, Duration::from_secs(3600))];
        let mut scheduler = Scheduler::new(rig.interpreter.clone(), tasks);
        scheduler.run().await;

        assert_eq!(downs(&rig.cursor), vec![65]);
        assert!(scheduler.tasks()[0].last_run_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_script_does_not_stop_loop() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let good = write_script(dir.path(), "good.json", &[("Key", "66")]).await;
        let tasks = vec![
            RecurringTask::interval(dir.path().join("gone.json"), Priority::High, Duration::from_secs(3600)),
            RecurringTask::interval(&good, Priority::Low, Duration::from_secs(3600)),
        ];

        stop_after(&rig.waiter, 20);
        let mut scheduler = Scheduler::new(rig.interpreter.clone(), tasks);
        scheduler.run().await;

        assert_eq!(downs(&rig.cursor), vec![66]);
        assert!(scheduler.tasks().iter().all(|t| t.last_run_at.is_some()));
    }
}
