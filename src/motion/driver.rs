//! 运动驱动：闭环逼近、路径遍历与惯性过冲
//!
//! 光标位置只通过 `move_to` 改变。逼近循环是比例控制（每步 45% 的剩余距离，单步上限 20），
//! 有时间上限，目标不可达时不会无限自旋。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};

use crate::actuator::transport::{ActuatorCommand, PositionSensor, Transport, MAX_STEP};
use crate::core::TransportError;
use crate::fatigue::FatigueModel;
use crate::geometry::{Point, Screen};
use crate::motion::path::PathPlanner;
use crate::observability::Journal;

/// 低于该距离直接修正，不画曲线也不过冲
pub const SHORT_MOVE_PX: f64 = 20.0;
/// 超过该距离触发惯性过冲
pub const OVERSHOOT_MOVE_PX: f64 = 250.0;

const GAIN: f64 = 0.45;
const STEP_LATENCY: Duration = Duration::from_millis(2);
const STRICT_BUDGET: Duration = Duration::from_millis(1_500);
const LOOSE_BUDGET: Duration = Duration::from_millis(500);

/// 一次移动走的分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    /// 距离 < 20px：严格逼近
    Direct,
    /// 20 ~ 250px：贝塞尔曲线
    Curve,
    /// > 250px：甩过头再拉回
    Overshoot,
}

/// 逼近结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    pub reached: bool,
    pub final_position: Point,
    pub steps: usize,
}

/// 启动过的逼近循环次数，按模式分开计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergePasses {
    pub strict: usize,
    pub loose: usize,
}

pub struct MotionDriver {
    transport: Arc<dyn Transport>,
    sensor: Arc<dyn PositionSensor>,
    planner: PathPlanner,
    fatigue: Arc<FatigueModel>,
    journal: Journal,
    strict_passes: AtomicUsize,
    loose_passes: AtomicUsize,
}

impl MotionDriver {
    pub fn new(
        transport: Arc<dyn Transport>,
        sensor: Arc<dyn PositionSensor>,
        planner: PathPlanner,
        fatigue: Arc<FatigueModel>,
        journal: Journal,
    ) -> Self {
        Self {
            transport,
            sensor,
            planner,
            fatigue,
            journal,
            strict_passes: AtomicUsize::new(0),
            loose_passes: AtomicUsize::new(0),
        }
    }

    pub fn converge_passes(&self) -> ConvergePasses {
        ConvergePasses {
            strict: self.strict_passes.load(Ordering::Relaxed),
            loose: self.loose_passes.load(Ordering::Relaxed),
        }
    }

    pub fn position(&self) -> Point {
        self.sensor.position()
    }

    pub fn screen(&self) -> Screen {
        self.planner.screen()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// 拟人化移动到目标点
    pub async fn move_to(&self, target: Point) -> Result<MoveKind, TransportError> {
        let screen = self.planner.screen();
        let (jx, jy) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-2..=2), rng.gen_range(-2..=2))
        };
        let goal = screen.clamp(screen.clamp(target).offset(jx, jy));

        let start = self.sensor.position();
        let distance = start.distance(goal);

        let kind = if distance < SHORT_MOVE_PX {
            self.converge_to(goal, 3.0, true).await?;
            MoveKind::Direct
        } else if distance > OVERSHOOT_MOVE_PX {
            let (overshoot_px, brake) = {
                let mut rng = rand::thread_rng();
                let ratio = rng.gen_range(0.03..=0.08);
                let brake = rng.gen_range(0.05..=0.15) * self.fatigue.reaction_multiplier();
                ((distance * ratio).min(50.0), brake)
            };
            let ux = f64::from(goal.x - start.x) / distance;
            let uy = f64::from(goal.y - start.y) / distance;
            let over = screen.clamp(Point::new(
                (f64::from(goal.x) + ux * overshoot_px) as i32,
                (f64::from(goal.y) + uy * overshoot_px) as i32,
            ));

            self.traverse(start, over).await?;
            // 刹车反应
            sleep(Duration::from_secs_f64(brake)).await;
            self.converge_to(goal, 2.0, true).await?;
            MoveKind::Overshoot
        } else {
            self.traverse(start, goal).await?;
            MoveKind::Curve
        };

        self.transport.flush_input().await?;
        Ok(kind)
    }

    /// 沿规划路径行走：前 20% 容差 15px、中段 30px、末段 5px、终点 3px
    pub async fn traverse(&self, start: Point, end: Point) -> Result<(), TransportError> {
        let waypoints = self.planner.plan_path(start, end);
        self.journal.path(&waypoints);

        let total = waypoints.len();
        for (i, waypoint) in waypoints.iter().enumerate() {
            let progress = i as f64 / total as f64;
            let cruising = progress > 0.2 && progress < 0.8;
            let tolerance = if i + 1 == total {
                3.0
            } else if cruising {
                30.0
            } else if progress <= 0.2 {
                15.0
            } else {
                5.0
            };

            self.converge_to(*waypoint, tolerance, false).await?;

            let pause = if cruising {
                0.001
            } else {
                0.001 + rand::thread_rng().gen_range(0.001..=0.003)
            };
            sleep(Duration::from_secs_f64(pause)).await;
        }
        Ok(())
    }

    /// 闭环逼近：严格模式 1.5s 上限，非严格 0.5s 且进入 1.5 倍容差即提前结束
    pub async fn converge_to(
        &self,
        target: Point,
        tolerance: f64,
        strict: bool,
    ) -> Result<Convergence, TransportError> {
        let (budget, passes) = if strict {
            (STRICT_BUDGET, &self.strict_passes)
        } else {
            (LOOSE_BUDGET, &self.loose_passes)
        };
        passes.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut steps = 0;

        while started.elapsed() < budget {
            let current = self.sensor.position();
            let (dx, dy) = (target.x - current.x, target.y - current.y);
            let distance = current.distance(target);
            if distance <= tolerance {
                return Ok(Convergence {
                    reached: true,
                    final_position: current,
                    steps,
                });
            }

            let (sx, sy) = (proportional_step(dx), proportional_step(dy));
            if sx != 0 || sy != 0 {
                self.transport.send(ActuatorCommand::step(sx, sy)).await?;
                steps += 1;
            }
            sleep(STEP_LATENCY).await;

            if !strict && distance < tolerance * 1.5 {
                break;
            }
        }

        let final_position = self.sensor.position();
        Ok(Convergence {
            reached: final_position.distance(target) <= tolerance,
            final_position,
            steps,
        })
    }
}

/// 单轴步长：round(delta * 0.45)，夹在 ±20，非零轴至少走 1
pub fn proportional_step(delta: i32) -> i32 {
    if delta == 0 {
        return 0;
    }
    let step = (f64::from(delta) * GAIN).round() as i32;
    let step = step.clamp(-MAX_STEP, MAX_STEP);
    if step == 0 {
        delta.signum()
    } else {
        step
    }
}
