//! 执行器门面：拟人化的 move / click / press / drag
//!
//! 整个进程只有一个逻辑执行器。所有操作持有同一把异步互斥锁，
//! 调度器、插件与"单步测试"都经由这里串行化，任何调用方都不直接碰传输层。

pub mod keys;
pub mod transport;

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::core::TransportError;
use crate::fatigue::FatigueModel;
use crate::geometry::{Point, Screen};
use crate::motion::{MotionDriver, MoveKind, PathPlanner};
use crate::observability::Journal;

pub use keys::{KeyCategory, KeyCode};
pub use transport::{
    connect, ActuatorCommand, DeadReckoning, PositionSensor, SimulatedTransport, Transport,
    VirtualCursor, WriterTransport,
};

const DRAG_SETTLE: RangeInclusive<f64> = 0.15..=0.25;
const DRAG_GRIP: RangeInclusive<f64> = 0.05..=0.10;
const CLICK_RECOVERY: RangeInclusive<f64> = 0.05..=0.10;
const RAW_KEY_LATENCY: Duration = Duration::from_millis(10);

pub struct Actuator {
    driver: MotionDriver,
    fatigue: Arc<FatigueModel>,
    lock: Mutex<()>,
}

impl Actuator {
    pub fn new(
        transport: Arc<dyn Transport>,
        sensor: Arc<dyn PositionSensor>,
        screen: Screen,
        fatigue: Arc<FatigueModel>,
        journal: Journal,
    ) -> Self {
        let driver = MotionDriver::new(
            transport,
            sensor,
            PathPlanner::new(screen),
            fatigue.clone(),
            journal,
        );
        Self {
            driver,
            fatigue,
            lock: Mutex::new(()),
        }
    }

    pub fn fatigue(&self) -> &Arc<FatigueModel> {
        &self.fatigue
    }

    pub fn is_simulated(&self) -> bool {
        self.driver.transport().is_simulated()
    }

    pub fn position(&self) -> Point {
        self.driver.position()
    }

    pub fn screen(&self) -> Screen {
        self.driver.screen()
    }

    pub async fn move_to(&self, target: Point) -> Result<MoveKind, TransportError> {
        let _guard = self.lock.lock().await;
        self.driver.move_to(target).await
    }

    pub async fn click(&self) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        self.click_unlocked().await
    }

    /// 移动到目标并点击
    pub async fn click_at(&self, target: Point) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        self.driver.move_to(target).await?;
        self.click_unlocked().await
    }

    async fn click_unlocked(&self) -> Result<(), TransportError> {
        let recovery = rand::thread_rng().gen_range(CLICK_RECOVERY) * self.fatigue.reaction_multiplier();
        self.driver.transport().send(ActuatorCommand::Click).await?;
        sleep(Duration::from_secs_f64(recovery)).await;
        Ok(())
    }

    /// 按下并抬起：按住时长取决于按键类别，再乘以反应倍率
    pub async fn press(&self, key: KeyCode) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        let (hold, release) = {
            let mut rng = rand::thread_rng();
            let hold = key.category().sample_hold(&mut rng) * self.fatigue.reaction_multiplier();
            (hold, rng.gen_range(keys::RELEASE_LATENCY))
        };
        tracing::debug!(code = key.0, hold = format!("{hold:.3}"), "Key press");

        let transport = self.driver.transport();
        transport.send(ActuatorCommand::Down(key)).await?;
        sleep(Duration::from_secs_f64(hold)).await;
        transport.send(ActuatorCommand::Up(key)).await?;
        sleep(Duration::from_secs_f64(release)).await;
        Ok(())
    }

    /// 按住左键从 `from` 拖到 `to`
    pub async fn drag(&self, from: Point, to: Point) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        let transport = self.driver.transport();

        self.driver.move_to(from).await?;
        pause(DRAG_SETTLE).await;
        transport.send(ActuatorCommand::Down(KeyCode::MOUSE_LEFT)).await?;
        pause(DRAG_GRIP).await;

        self.driver.move_to(to).await?;
        pause(DRAG_SETTLE).await;
        transport.send(ActuatorCommand::Up(KeyCode::MOUSE_LEFT)).await?;
        pause(DRAG_GRIP).await;
        Ok(())
    }

    pub async fn key_down(&self, key: KeyCode) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        self.driver.transport().send(ActuatorCommand::Down(key)).await?;
        sleep(RAW_KEY_LATENCY).await;
        Ok(())
    }

    pub async fn key_up(&self, key: KeyCode) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        self.driver.transport().send(ActuatorCommand::Up(key)).await?;
        sleep(RAW_KEY_LATENCY).await;
        Ok(())
    }

    /// 松开所有按键（停止时的紧急释放）
    pub async fn release_all(&self) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        self.driver.transport().send(ActuatorCommand::ReleaseAll).await
    }

    /// 在当前位置附近随机挪动，最大偏移 `max_offset` 像素
    pub async fn nudge(&self, max_offset: i32) -> Result<(), TransportError> {
        let max_offset = max_offset.abs();
        let (dx, dy) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(-max_offset..=max_offset),
                rng.gen_range(-max_offset..=max_offset),
            )
        };
        let target = self.position().offset(dx, dy);
        self.move_to(target).await.map(|_| ())
    }
}

async fn pause(range: RangeInclusive<f64>) {
    let secs = rand::thread_rng().gen_range(range);
    sleep(Duration::from_secs_f64(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn virtual_actuator(start: Point) -> (Actuator, Arc<VirtualCursor>) {
        let screen = Screen::new(1920, 1080);
        let cursor = Arc::new(VirtualCursor::new(screen, start));
        let actuator = Actuator::new(
            cursor.clone(),
            cursor.clone(),
            screen,
            Arc::new(FatigueModel::default()),
            Journal::default(),
        );
        (actuator, cursor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_sends_down_then_up() {
        let (actuator, cursor) = virtual_actuator(Point::new(10, 10));
        actuator.press(KeyCode::RETURN).await.unwrap();
        assert_eq!(
            cursor.commands(),
            vec![
                ActuatorCommand::Down(KeyCode::RETURN),
                ActuatorCommand::Up(KeyCode::RETURN)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_hold_scales_with_category() {
        let (actuator, _) = virtual_actuator(Point::new(10, 10));
        let started = tokio::time::Instant::now();
        actuator.press(KeyCode::LEFT_SHIFT).await.unwrap();
        let elapsed = started.elapsed().as_secs_f64();
        // 0.15 * 0.9 + 0.02 下限，0.25 * 1.1 + 0.05 上限（新会话）
        assert!(elapsed >= 0.15 * 0.9 + 0.02 - 1e-3, "elapsed {elapsed}");
        assert!(elapsed <= 0.25 * 1.1 + 0.05 + 1e-3, "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drag_holds_left_button_across_move() {
        let (actuator, cursor) = virtual_actuator(Point::new(100, 100));
        actuator
            .drag(Point::new(300, 300), Point::new(600, 320))
            .await
            .unwrap();

        let commands = cursor.commands();
        let down = commands
            .iter()
            .position(|c| *c == ActuatorCommand::Down(KeyCode::MOUSE_LEFT))
            .unwrap();
        let up = commands
            .iter()
            .position(|c| *c == ActuatorCommand::Up(KeyCode::MOUSE_LEFT))
            .unwrap();
        assert!(down < up);
        assert!(commands[down + 1..up]
            .iter()
            .all(|c| matches!(c, ActuatorCommand::Move { .. })));
        assert!(cursor.position().distance(Point::new(600, 320)) <= 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_serialized() {
        let (actuator, cursor) = virtual_actuator(Point::new(100, 100));
        let actuator = Arc::new(actuator);
        let a = {
            let actuator = actuator.clone();
            tokio::spawn(async move { actuator.press(KeyCode(97)).await })
        };
        let b = {
            let actuator = actuator.clone();
            tokio::spawn(async move { actuator.press(KeyCode(98)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let commands = cursor.commands();
        assert_eq!(commands.len(), 4);
        // 每次按键的按下与抬起必须相邻
        for pair in commands.chunks(2) {
            match (pair[0], pair[1]) {
                (ActuatorCommand::Down(a), ActuatorCommand::Up(b)) => assert_eq!(a, b),
                other => panic!("interleaved commands: {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_all_and_nudge() {
        let (actuator, cursor) = virtual_actuator(Point::new(500, 500));
        actuator.release_all().await.unwrap();
        assert_eq!(cursor.commands(), vec![ActuatorCommand::ReleaseAll]);

        actuator.nudge(5).await.unwrap();
        assert!(cursor.position().distance(Point::new(500, 500)) <= 15.0);
    }
}
