//! 三阶贝塞尔路径规划
//!
//! 两个控制点放在起止向量的 25% / 75% 处并加入随机偏移，偏移幅度随距离增大（上限 300px），
//! 采样点全部夹在屏幕边界内。

use rand::Rng;

use crate::geometry::{Point, Screen};

/// 路径规划器（纯函数，只依赖屏幕边界）
#[derive(Debug, Clone, Copy)]
pub struct PathPlanner {
    screen: Screen,
}

impl PathPlanner {
    pub fn new(screen: Screen) -> Self {
        Self { screen }
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn plan_path(&self, start: Point, end: Point) -> Vec<Point> {
        self.plan_path_with(start, end, &mut rand::thread_rng())
    }

    pub fn plan_path_with<R: Rng + ?Sized>(&self, start: Point, end: Point, rng: &mut R) -> Vec<Point> {
        let distance = start.distance(end);
        let steps = ((distance / 20.0) as usize).max(10);

        let (sx, sy) = (f64::from(start.x), f64::from(start.y));
        let (ex, ey) = (f64::from(end.x), f64::from(end.y));
        let (vx, vy) = (ex - sx, ey - sy);

        let spread = (distance * 0.5).min(300.0);
        let mut jitter = || {
            if spread > 0.0 {
                rng.gen_range(-spread..=spread)
            } else {
                0.0
            }
        };
        let c1 = (sx + vx * 0.25 + jitter(), sy + vy * 0.25 + jitter());
        let c2 = (sx + vx * 0.75 + jitter(), sy + vy * 0.75 + jitter());

        (0..=steps)
            .map(|i| {
                let t = i as f64 / steps as f64;
                let u = 1.0 - t;
                let (uu, tt) = (u * u, t * t);
                let x = uu * u * sx + 3.0 * uu * t * c1.0 + 3.0 * u * tt * c2.0 + tt * t * ex;
                let y = uu * u * sy + 3.0 * uu * t * c1.1 + 3.0 * u * tt * c2.1 + tt * t * ey;
                self.screen.clamp(Point::new(x.round() as i32, y.round() as i32))
            })
            .collect()
    }
}
