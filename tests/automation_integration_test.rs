//! 调度与脚本解释的端到端集成测试

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use drone::actuator::{Actuator, ActuatorCommand, KeyCode, VirtualCursor};
use drone::config::AppConfig;
use drone::core::RunState;
use drone::fatigue::FatigueModel;
use drone::geometry::{Point, Screen};
use drone::motion::PathPlanner;
use drone::observability::Journal;
use drone::perception::{is_text_match, ScriptedPerception};
use drone::plugins::{EngineHandle, PluginRegistry};
use drone::scheduler::{PushOutcome, Waiter};
use drone::script::{Script, StepRecord, Variables};
use drone::{Engine, Interpreter, Interrupt, Priority, RunOutcome, ScheduleQueue, ScheduledTask};
use tokio_util::sync::CancellationToken;

struct Harness {
    interpreter: Interpreter,
    cursor: Arc<VirtualCursor>,
    perception: Arc<ScriptedPerception>,
    stop: CancellationToken,
}

fn harness() -> Harness {
    let screen = Screen::new(1920, 1080);
    let journal = Journal::default();
    let cursor = Arc::new(VirtualCursor::new(screen, Point::new(800, 600)));
    let actuator = Arc::new(Actuator::new(
        cursor.clone(),
        cursor.clone(),
        screen,
        Arc::new(FatigueModel::default()),
        journal.clone(),
    ));
    let perception = Arc::new(ScriptedPerception::new());
    let stop = CancellationToken::new();
    let waiter = Waiter::new(
        stop.clone(),
        Arc::new(ScheduleQueue::new()),
        Arc::new(RunState::new()),
        journal.clone(),
    );
    let handle = EngineHandle::new(actuator, perception.clone(), journal, waiter);
    Harness {
        interpreter: Interpreter::new(handle, Arc::new(PluginRegistry::with_builtins())),
        cursor,
        perception,
        stop,
    }
}

fn script(records: &[(&str, &str)]) -> Script {
    Script::new(records.iter().map(|(k, v)| StepRecord::new(*k, *v)).collect())
}

fn key_downs(cursor: &VirtualCursor) -> Vec<u16> {
    cursor
        .commands()
        .iter()
        .filter_map(|c| match c {
            ActuatorCommand::Down(KeyCode(code)) if *code != KeyCode::MOUSE_LEFT.0 => Some(*code),
            _ => None,
        })
        .collect()
}

fn cancel_after(token: &CancellationToken, secs: u64) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        token.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn loop_halts_on_fourth_arrival() {
    let h = harness();
    let s = script(&[("Label", "L"), ("Key", "65"), ("Loop", "L|3|Stop")]);
    let outcome = h.interpreter.run(&s, &Variables::new()).await;
    assert_eq!(outcome, Ok(RunOutcome::Halted));
    assert_eq!(key_downs(&h.cursor), vec![65; 4]);

    // 计数器在每次执行开始时重置
    h.cursor.clear_commands();
    h.interpreter.run(&s, &Variables::new()).await.unwrap();
    assert_eq!(key_downs(&h.cursor).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn find_img_never_breaks_a_loop_but_if_image_does() {
    let h = harness();
    h.perception.set_image("x.png", Some(Point::new(50, 50)));

    let endless = script(&[
        ("Label", "A"),
        ("Wait", "1"),
        ("FindImg", "x.png|0,0,100,100"),
        ("Goto", "A"),
    ]);
    cancel_after(&h.stop, 30);
    let outcome = h.interpreter.run(&endless, &Variables::new()).await;
    assert_eq!(outcome, Err(Interrupt::Stop));
    // 每轮都点到了目标，但循环没有因此结束
    let clicks = h
        .cursor
        .commands()
        .iter()
        .filter(|c| **c == ActuatorCommand::Click)
        .count();
    assert!(clicks >= 2, "expected repeated clicks, got {clicks}");

    let h = harness();
    h.perception.set_image("x.png", Some(Point::new(50, 50)));
    let guarded = script(&[
        ("Label", "A"),
        ("Wait", "1"),
        ("IfImage", "x.png|0,0,100,100|DONE"),
        ("Goto", "A"),
        ("Label", "DONE"),
    ]);
    let outcome = h.interpreter.run(&guarded, &Variables::new()).await;
    assert_eq!(outcome, Ok(RunOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn preempting_task_runs_before_recurring_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let routine = dir.path().join("routine.json");
    let urgent = dir.path().join("urgent.json");
    script(&[("Key", "65"), ("Wait", "60"), ("Key", "66")])
        .save(&routine)
        .await
        .unwrap();
    script(&[("Key", "70")]).save(&urgent).await.unwrap();

    let mut config = AppConfig::default();
    config.watchdog.enabled = false;
    config.tasks.push(drone::config::TaskEntry {
        script: routine.clone(),
        priority: Priority::Low,
        mode: drone::config::TaskModeKind::Interval,
        interval_secs: 3600,
        window_start: "00:00".into(),
        window_end: "23:59".into(),
    });

    let cursor = Arc::new(VirtualCursor::new(Screen::new(1920, 1080), Point::new(960, 540)));
    let engine = Arc::new(
        Engine::new(
            &config,
            cursor.clone(),
            cursor.clone(),
            Arc::new(ScriptedPerception::new()),
            PluginRegistry::new(),
        )
        .unwrap(),
    );

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(key_downs(&cursor), vec![65]);

    let task = ScheduledTask::new("boss", &urgent, Local::now() - chrono::Duration::seconds(1), Priority::High)
        .spawned_at("21:00");
    assert_eq!(engine.queue().push(task.clone()), PushOutcome::Queued);
    assert_eq!(engine.queue().push(task), PushOutcome::DuplicatePending);

    tokio::time::sleep(Duration::from_secs(5)).await;
    engine.stop();
    runner.await.unwrap();

    // 例行任务被打断 → 紧急任务只执行一次 → 例行任务重新开始，从未走到 66
    assert_eq!(key_downs(&cursor), vec![65, 70, 65]);
}

#[tokio::test(start_paused = true)]
async fn scheduled_variables_are_bound() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("event.json");
    script(&[("Key", "{SKILL}")]).save(&path).await.unwrap();

    let h = harness();
    let task = ScheduledTask::new("event", &path, Local::now(), Priority::Normal)
        .with_variable("SKILL", "81");
    let outcome = h.interpreter.run_file(&task.script, &task.variables).await;
    assert_eq!(outcome, Ok(RunOutcome::Completed));
    assert_eq!(key_downs(&h.cursor), vec![81]);
}

#[test]
fn text_match_threshold_boundaries() {
    assert!(is_text_match("Boss", "The Boss Arrives", 0.5));
    assert!(!is_text_match("Boss", "xyz", 0.9));
}

#[test]
fn planned_paths_stay_on_screen() {
    let screen = Screen::new(1920, 1080);
    let planner = PathPlanner::new(screen);
    for (from, to) in [
        (Point::new(10, 10), Point::new(1900, 1070)),
        (Point::new(960, 540), Point::new(-50, 4000)),
        (Point::new(300, 300), Point::new(305, 302)),
    ] {
        let path = planner.plan_path(from, to);
        assert!(path.first().unwrap().distance(from) <= 1.0);
        assert_eq!(*path.last().unwrap(), screen.clamp(to));
        assert!(path.iter().all(|p| screen.contains(*p)));
    }
}

#[test]
fn humanized_wait_lower_bound() {
    let fatigue = FatigueModel::default();
    for base in [0.0, 0.1, 1.0, 5.0, 30.0] {
        assert!(fatigue.humanized_wait(base) >= 0.5 * base);
        let m = fatigue.reaction_multiplier();
        assert!((0.9..1.9).contains(&m));
    }
}
