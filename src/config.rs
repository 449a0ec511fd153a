//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DRONE__*` 覆盖（双下划线表示嵌套，如 `DRONE__WATCHDOG__ENABLED=false`）。

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use serde::Deserialize;

use crate::core::Priority;
use crate::geometry::Screen;
use crate::scheduler::{RecurringTask, SchedulerSettings};
use crate::watchdog::WatchdogSettings;
use crate::watcher::{WatchedEvent, WatcherSettings};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub fatigue: FatigueSection,
    pub screen: ScreenSection,
    pub transport: TransportSection,
    pub scheduler: SchedulerSection,
    pub watchdog: WatchdogSection,
    pub watcher: WatcherSection,
    pub plugins: PluginsSection,
    /// 周期任务列表 `[[tasks]]`
    pub tasks: Vec<TaskEntry>,
}

/// [fatigue] 段：多久之后疲劳度封顶
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FatigueSection {
    pub cutoff_secs: u64,
}

impl Default for FatigueSection {
    fn default() -> Self {
        Self { cutoff_secs: 14_400 }
    }
}

impl FatigueSection {
    pub fn cutoff(&self) -> Duration {
        Duration::from_secs(self.cutoff_secs.max(1))
    }
}

/// [screen] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenSection {
    pub width: i32,
    pub height: i32,
}

impl Default for ScreenSection {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl ScreenSection {
    pub fn screen(&self) -> Screen {
        Screen::new(self.width.max(3), self.height.max(3))
    }
}

/// [transport] 段：执行器设备路径，未设置或打不开时进入模拟模式
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransportSection {
    pub device: Option<PathBuf>,
}

/// [scheduler] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// 可取消等待的检查间隔（毫秒）
    pub tick_ms: u64,
    pub cooldown_min_secs: f64,
    pub cooldown_max_secs: f64,
    pub idle_retry_secs: f64,
    /// 已执行任务编号保留条数
    pub executed_history: usize,
    pub max_script_depth: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            cooldown_min_secs: 1.0,
            cooldown_max_secs: 3.0,
            idle_retry_secs: 1.0,
            executed_history: 50,
            max_script_depth: 3,
        }
    }
}

impl SchedulerSection {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn settings(&self) -> SchedulerSettings {
        let lo = bounded_secs(self.cooldown_min_secs, 0.0);
        let hi = bounded_secs(self.cooldown_max_secs, 0.0);
        SchedulerSettings {
            cooldown_secs: lo.min(hi)..=lo.max(hi),
            idle_retry: Duration::from_secs_f64(bounded_secs(self.idle_retry_secs, 0.05)),
        }
    }
}

/// 秒数配置收敛到 `[floor, 3600]`；NaN 取下限
fn bounded_secs(value: f64, floor: f64) -> f64 {
    if value.is_nan() {
        floor
    } else {
        value.clamp(floor, 3_600.0)
    }
}

/// [watchdog] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_static_checks: u32,
    pub static_threshold: f64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            max_static_checks: 5,
            static_threshold: 50.0,
        }
    }
}

impl WatchdogSection {
    pub fn settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            max_static_checks: self.max_static_checks.max(1),
            static_threshold: self.static_threshold,
        }
    }
}

/// [watcher] 段：事件计时文件监控；事件列表写在 `[[watcher.events]]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    pub enabled: bool,
    pub timers_file: PathBuf,
    pub poll_secs: u64,
    /// 文件没变时每隔几次轮询仍检查一次
    pub heartbeat_every: u32,
    pub pre_notify_mins: i64,
    pub expiration_mins: i64,
    pub allow_interrupt: bool,
    /// 事件没有单独指定脚本时使用
    pub default_script: Option<PathBuf>,
    pub events: Vec<WatchedEvent>,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            enabled: false,
            timers_file: PathBuf::from("timers.json"),
            poll_secs: 10,
            heartbeat_every: 6,
            pre_notify_mins: 2,
            expiration_mins: 60,
            allow_interrupt: true,
            default_script: None,
            events: Vec::new(),
        }
    }
}

impl WatcherSection {
    pub fn settings(&self) -> WatcherSettings {
        WatcherSettings {
            timers_file: self.timers_file.clone(),
            poll: Duration::from_secs(self.poll_secs.max(1)),
            heartbeat_every: self.heartbeat_every.max(1),
            pre_notify: chrono::Duration::minutes(self.pre_notify_mins.clamp(0, 60)),
            expiration: chrono::Duration::minutes(self.expiration_mins.clamp(10, 300)),
            allow_interrupt: self.allow_interrupt,
            default_script: self.default_script.clone(),
            events: self.events.clone(),
        }
    }
}

/// [plugins] 段：插件清单目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    pub directory: PathBuf,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plugins"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskModeKind {
    #[default]
    Interval,
    DailyWindow,
}

/// `[[tasks]]` 条目
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    pub script: PathBuf,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub mode: TaskModeKind,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// "HH:MM"
    #[serde(default = "default_window_start")]
    pub window_start: String,
    #[serde(default = "default_window_end")]
    pub window_end: String,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_window_start() -> String {
    "00:00".to_string()
}

fn default_window_end() -> String {
    "23:59".to_string()
}

impl TaskEntry {
    pub fn to_recurring(&self) -> Result<RecurringTask, config::ConfigError> {
        match self.mode {
            TaskModeKind::Interval => Ok(RecurringTask::interval(
                &self.script,
                self.priority,
                Duration::from_secs(self.interval_secs),
            )),
            TaskModeKind::DailyWindow => Ok(RecurringTask::daily_window(
                &self.script,
                self.priority,
                parse_clock(&self.window_start)?,
                parse_clock(&self.window_end)?,
            )),
        }
    }
}

fn parse_clock(s: &str) -> Result<NaiveTime, config::ConfigError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| {
        config::ConfigError::Message(format!("invalid time of day '{s}' (expected HH:MM): {e}"))
    })
}

impl AppConfig {
    pub fn recurring_tasks(&self) -> Result<Vec<RecurringTask>, config::ConfigError> {
        self.tasks.iter().map(TaskEntry::to_recurring).collect()
    }
}

/// 从 config 目录加载配置，环境变量 DRONE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DRONE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DRONE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskMode;

    fn from_toml(s: &str) -> Result<AppConfig, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(s, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    #[test]
    fn test_defaults() {
        let cfg = from_toml("").unwrap();
        assert_eq!(cfg.fatigue.cutoff(), Duration::from_secs(14_400));
        assert_eq!(cfg.screen.screen(), Screen::new(1920, 1080));
        assert!(cfg.transport.device.is_none());
        assert_eq!(cfg.scheduler.tick(), Duration::from_millis(50));
        assert_eq!(cfg.scheduler.executed_history, 50);
        assert!(cfg.watchdog.enabled);
        assert_eq!(cfg.watchdog.settings().max_static_checks, 5);
        assert_eq!(cfg.plugins.directory, PathBuf::from("plugins"));
        assert!(cfg.tasks.is_empty());
        assert!(!cfg.watcher.enabled);
        assert_eq!(cfg.watcher.settings().poll, Duration::from_secs(10));
    }

    #[test]
    fn test_watcher_section() {
        let cfg = from_toml(
            r#"
[watcher]
enabled = true
timers_file = "data/timers.json"
expiration_mins = 5000
default_script = "scripts/boss.json"

[[watcher.events]]
id = "b01"
name = "Dragon"
level = 85

[[watcher.events]]
id = "b02"
script = "scripts/golem.json"
enabled = false
"#,
        )
        .unwrap();

        let settings = cfg.watcher.settings();
        assert!(cfg.watcher.enabled);
        assert_eq!(settings.timers_file, PathBuf::from("data/timers.json"));
        assert_eq!(settings.expiration, chrono::Duration::minutes(300));
        assert_eq!(settings.pre_notify, chrono::Duration::minutes(2));
        assert_eq!(settings.events.len(), 2);
        assert_eq!(settings.events[0].display_name(), "Dragon");
        assert_eq!(settings.events[0].level, 85);
        assert_eq!(settings.events[1].display_name(), "b02");
        assert!(!settings.events[1].enabled);
        assert_eq!(settings.events[1].script, Some(PathBuf::from("scripts/golem.json")));
    }

    #[test]
    fn test_sections_and_tasks() {
        let cfg = from_toml(
            r#"
[screen]
width = 2560
height = 1440

[scheduler]
cooldown_min_secs = 4.0
cooldown_max_secs = 2.0

[[tasks]]
script = "scripts/farm.json"
priority = 2
interval_secs = 900

[[tasks]]
script = "scripts/daily.json"
priority = 0
mode = "daily_window"
window_start = "09:30"
window_end = "11:00"
"#,
        )
        .unwrap();

        assert_eq!(cfg.screen.screen(), Screen::new(2560, 1440));
        assert_eq!(cfg.scheduler.settings().cooldown_secs, 2.0..=4.0);

        let tasks = cfg.recurring_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].priority, Priority::Low);
        assert_eq!(
            tasks[0].mode,
            TaskMode::Interval {
                every: Duration::from_secs(900)
            }
        );
        assert_eq!(tasks[1].priority, Priority::High);
        assert!(matches!(tasks[1].mode, TaskMode::DailyWindow { .. }));
    }

    #[test]
    fn test_unbounded_durations_are_clamped() {
        let section = SchedulerSection {
            cooldown_min_secs: f64::NAN,
            cooldown_max_secs: f64::INFINITY,
            idle_retry_secs: 1e30,
            ..SchedulerSection::default()
        };
        let settings = section.settings();
        assert_eq!(settings.cooldown_secs, 0.0..=3_600.0);
        assert_eq!(settings.idle_retry, Duration::from_secs(3_600));
    }

    #[test]
    fn test_bad_window_rejected() {
        let cfg = from_toml(
            "[[tasks]]\nscript = \"a.json\"\nmode = \"daily_window\"\nwindow_start = \"9am\"\n",
        )
        .unwrap();
        assert!(cfg.recurring_tasks().is_err());
        assert!(from_toml("[[tasks]]\nscript = \"a.json\"\npriority = 7\n").is_err());
    }
}
