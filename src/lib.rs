//! Drone - Rust 拟人化输入自动化引擎
//!
//! 模块划分：
//! - **actuator**: 执行器门面（move / click / press / drag）与行协议传输层
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与中断、运行状态、停止信号、引擎门面
//! - **fatigue**: 疲劳模型，所有等待与动作噪声的来源
//! - **geometry**: 点、区域、屏幕与颜色
//! - **interpreter**: 脚本解释器（跳转、循环、子脚本、条件分支）
//! - **motion**: 路径规划与闭环收敛移动
//! - **observability**: tracing 初始化与面向 GUI 的通知广播
//! - **perception**: 视觉能力接口（找图 / OCR / 找色）与文本模糊匹配
//! - **plugins**: 动作 / 判断插件注册表与内置插件
//! - **scheduler**: 周期任务、预约队列与可取消等待
//! - **script**: 脚本文件与步骤编解码
//! - **watchdog**: 画面静止检测
//! - **watcher**: 事件计时文件监控，生成预约任务

pub mod actuator;
pub mod config;
pub mod core;
pub mod fatigue;
pub mod geometry;
pub mod interpreter;
pub mod motion;
pub mod observability;
pub mod perception;
pub mod plugins;
pub mod scheduler;
pub mod script;
pub mod watchdog;
pub mod watcher;

pub use crate::core::{Engine, EngineError, Interrupt, Priority};
pub use interpreter::{Interpreter, RunOutcome};
pub use scheduler::{RecurringTask, ScheduleQueue, ScheduledTask};
