//! 运动规划：贝塞尔路径 + 闭环逼近驱动

pub mod driver;
pub mod path;

pub use driver::{proportional_step, ConvergePasses, Convergence, MotionDriver, MoveKind};
pub use path::PathPlanner;
