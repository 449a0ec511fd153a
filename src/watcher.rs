//! 事件计时监控：轮询外部计时文件，把即将发生的事件转成预约任务推入队列
//!
//! 计时文件是 JSON 对象 `{ "<事件编号>": { "date": "YYYY-MM-DD", "time": "HH:MM" } }`，
//! 由别的程序维护。时间未知（缺失、"待確認" 或无法解析）的条目直接跳过。
//!
//! 对每个已登记且启用的事件：
//! - 开始时间 = 发生时间 − 提前量
//! - 开始时间已过但未超过失效窗口，或开始时间在 10 分钟以内，才推送
//! - 同一事件 60 秒内不重复推送；队列本身还会按 `name|spawn_time` 去重
//! - 允许插队时按等级给优先级（≥80 High，≥60 Normal，其余 Low），否则一律 Low
//!
//! 文件修改时间变化时立即检查，否则每 `heartbeat_every` 次轮询检查一次。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{Priority, WatcherError};
use crate::observability::Journal;
use crate::scheduler::{PushOutcome, ScheduleQueue, ScheduledTask};

/// 推送给脚本的事件名变量
pub const EVENT_NAME_VARIABLE: &str = "BOSS_NAME";
/// 开始时间之前多久就推送（秒）
pub const LOOK_AHEAD_SECS: i64 = 600;
/// 同一事件两次推送的最小间隔（秒）
pub const RESEND_AFTER_SECS: i64 = 60;
/// 近况报告只看这么久之内的事件（分钟）
pub const REPORT_HORIZON_MINS: i64 = 120;
const REPORT_LIMIT: usize = 3;
const READ_ATTEMPTS: u32 = 3;
const READ_RETRY: Duration = Duration::from_millis(500);
const SPAWN_FORMAT: &str = "%Y-%m-%d %H:%M";

/// 登记的事件：计时文件里的编号对应到名称、等级与脚本
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WatchedEvent {
    pub id: String,
    /// 缺省用编号
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub level: u32,
    /// 缺省用 `default_script`
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl WatchedEvent {
    pub fn new(id: impl Into<String>, level: u32) -> Self {
        Self {
            id: id.into(),
            name: None,
            level,
            script: None,
            enabled: true,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// 等级到优先级
pub fn priority_for_level(level: u32, allow_interrupt: bool) -> Priority {
    match level {
        _ if !allow_interrupt => Priority::Low,
        80.. => Priority::High,
        60..=79 => Priority::Normal,
        _ => Priority::Low,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TimerEntry {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

impl TimerEntry {
    /// 发生时间；未知或格式不对返回 None
    pub fn spawn_time(&self) -> Option<NaiveDateTime> {
        let (date, time) = (self.date.as_deref()?.trim(), self.time.as_deref()?.trim());
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), SPAWN_FORMAT).ok()
    }
}

/// 计时文件内容：事件编号 → 时间
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct TimerDocument {
    pub entries: BTreeMap<String, TimerEntry>,
}

impl TimerDocument {
    pub fn parse(path: &Path, text: &str) -> Result<Self, WatcherError> {
        serde_json::from_str(text).map_err(|source| WatcherError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, WatcherError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| WatcherError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &text)
    }
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub timers_file: PathBuf,
    pub poll: Duration,
    pub heartbeat_every: u32,
    pub pre_notify: chrono::Duration,
    /// 开始时间过后多久仍然推送
    pub expiration: chrono::Duration,
    pub allow_interrupt: bool,
    pub default_script: Option<PathBuf>,
    pub events: Vec<WatchedEvent>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            timers_file: PathBuf::from("timers.json"),
            poll: Duration::from_secs(10),
            heartbeat_every: 6,
            pre_notify: chrono::Duration::minutes(2),
            expiration: chrono::Duration::minutes(60),
            allow_interrupt: true,
            default_script: None,
            events: Vec::new(),
        }
    }
}

/// 推送判定的纯状态：只记录每个事件上次推送的时间
#[derive(Debug)]
pub struct EventBoard {
    settings: WatcherSettings,
    last_sent: HashMap<String, DateTime<Local>>,
}

impl EventBoard {
    pub fn new(settings: WatcherSettings) -> Self {
        Self {
            settings,
            last_sent: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &WatcherSettings {
        &self.settings
    }

    fn script_for(&self, event: &WatchedEvent) -> Option<PathBuf> {
        event
            .script
            .clone()
            .or_else(|| self.settings.default_script.clone())
            .filter(|path| path.exists())
    }

    /// 启用的事件及其发生时间
    fn timed<'a>(
        &'a self,
        doc: &'a TimerDocument,
    ) -> impl Iterator<Item = (&'a WatchedEvent, NaiveDateTime)> + 'a {
        self.settings
            .events
            .iter()
            .filter(|event| event.enabled)
            .filter_map(|event| Some((event, doc.entries.get(&event.id)?.spawn_time()?)))
    }

    fn in_window(&self, start: DateTime<Local>, now: DateTime<Local>) -> bool {
        if start <= now {
            now - start < self.settings.expiration
        } else {
            start - now < chrono::Duration::seconds(LOOK_AHEAD_SECS)
        }
    }

    /// 这一轮需要推送的任务，并记下推送时间
    pub fn evaluate(&mut self, doc: &TimerDocument, now: DateTime<Local>) -> Vec<ScheduledTask> {
        let resend_after = chrono::Duration::seconds(RESEND_AFTER_SECS);
        let mut due = Vec::new();
        for (event, spawn) in self.timed(doc) {
            let Some(script) = self.script_for(event) else {
                continue;
            };
            let Some(spawn_local) = Local.from_local_datetime(&spawn).earliest() else {
                continue;
            };
            let start = spawn_local - self.settings.pre_notify;
            if !self.in_window(start, now) {
                continue;
            }
            let throttled = self
                .last_sent
                .get(&event.id)
                .is_some_and(|sent| now - *sent <= resend_after);
            if throttled {
                continue;
            }

            let name = event.display_name();
            let task = ScheduledTask::new(
                name,
                script,
                start,
                priority_for_level(event.level, self.settings.allow_interrupt),
            )
            .spawned_at(spawn.format(SPAWN_FORMAT).to_string())
            .with_variable(EVENT_NAME_VARIABLE, name);
            due.push((event.id.clone(), task));
        }

        due.into_iter()
            .map(|(id, task)| {
                self.last_sent.insert(id, now);
                task
            })
            .collect()
    }

    /// 未来两小时内最近的几个事件：(名称, 剩余分钟)
    pub fn upcoming(&self, doc: &TimerDocument, now: DateTime<Local>) -> Vec<(String, i64)> {
        let horizon = chrono::Duration::minutes(REPORT_HORIZON_MINS);
        let mut upcoming: Vec<(String, i64)> = self
            .timed(doc)
            .filter(|(event, _)| self.script_for(event).is_some())
            .filter_map(|(event, spawn)| {
                let left = Local.from_local_datetime(&spawn).earliest()? - now;
                (left > chrono::Duration::zero() && left < horizon)
                    .then(|| (event.display_name().to_string(), left.num_minutes()))
            })
            .collect();
        upcoming.sort_by_key(|(_, minutes)| *minutes);
        upcoming.truncate(REPORT_LIMIT);
        upcoming
    }
}

pub struct Watcher {
    queue: Arc<ScheduleQueue>,
    stop: CancellationToken,
    journal: Journal,
    board: EventBoard,
}

impl Watcher {
    pub fn new(queue: Arc<ScheduleQueue>, stop: CancellationToken, journal: Journal) -> Self {
        Self {
            queue,
            stop,
            journal,
            board: EventBoard::new(WatcherSettings::default()),
        }
    }

    pub fn with_settings(mut self, settings: WatcherSettings) -> Self {
        self.board = EventBoard::new(settings);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 运行到停止信号为止
    pub async fn run(mut self) {
        let settings = self.board.settings().clone();
        let every = settings.heartbeat_every.max(1);
        let mut last_mtime: Option<SystemTime> = None;
        let mut heartbeat: u32 = 0;
        tracing::info!(
            file = %settings.timers_file.display(),
            events = settings.events.len(),
            "Event watcher started"
        );

        loop {
            match tokio::fs::metadata(&settings.timers_file).await {
                Ok(meta) => {
                    let mtime = meta.modified().ok();
                    if mtime != last_mtime || heartbeat % every == 0 {
                        last_mtime = mtime;
                        self.check(&settings.timers_file).await;
                    }
                }
                Err(_) => self.journal.warn(format!(
                    "Timer file not found: {}",
                    settings.timers_file.display()
                )),
            }
            heartbeat = heartbeat.wrapping_add(1);

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(settings.poll) => {}
            }
        }
        tracing::debug!("Event watcher stopped");
    }

    /// 文件可能正被写入，读不出来时稍等重试
    async fn read_document(&self, path: &Path) -> Option<TimerDocument> {
        let mut attempt = 1;
        loop {
            match TimerDocument::load(path).await {
                Ok(doc) => return Some(doc),
                Err(e) if attempt >= READ_ATTEMPTS => {
                    self.journal.warn(e.to_string());
                    return None;
                }
                Err(e) => tracing::debug!(attempt, "Timer file read retry: {}", e),
            }
            attempt += 1;
            tokio::time::sleep(READ_RETRY).await;
        }
    }

    async fn check(&mut self, path: &Path) {
        let Some(doc) = self.read_document(path).await else {
            return;
        };
        let now = Local::now();

        for task in self.board.evaluate(&doc, now) {
            let (name, start, priority) = (task.name.clone(), task.start_time, task.priority);
            match self.queue.push(task) {
                PushOutcome::Queued => self.journal.info(format!(
                    "Scheduled {name} at {} ({})",
                    start.format("%H:%M:%S"),
                    priority.label()
                )),
                outcome => tracing::debug!(?outcome, "Event {} not queued", name),
            }
        }

        let upcoming = self.board.upcoming(&doc, now);
        if !upcoming.is_empty() {
            let next = upcoming
                .iter()
                .map(|(name, minutes)| format!("{name}({minutes}m)"))
                .collect::<Vec<_>>()
                .join(", ");
            self.journal.info(format!("Watching timers, next: {next}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use tempfile::TempDir;

    fn at(now: DateTime<Local>, minutes: i64) -> TimerEntry {
        let spawn = now + chrono::Duration::minutes(minutes);
        TimerEntry {
            date: Some(spawn.format("%Y-%m-%d").to_string()),
            time: Some(spawn.format("%H:%M").to_string()),
        }
    }

    fn doc(entries: &[(&str, TimerEntry)]) -> TimerDocument {
        TimerDocument {
            entries: entries
                .iter()
                .map(|(id, entry)| (id.to_string(), entry.clone()))
                .collect(),
        }
    }

    /// 以整分钟为基准，避免格式化截断秒数
    fn minute_now() -> DateTime<Local> {
        Local::now().with_second(0).unwrap().with_nanosecond(0).unwrap()
    }

    fn board(dir: &TempDir, events: Vec<WatchedEvent>) -> EventBoard {
        let script = dir.path().join("event.json");
        std::fs::write(&script, "[]").unwrap();
        EventBoard::new(WatcherSettings {
            default_script: Some(script),
            events,
            ..WatcherSettings::default()
        })
    }

    #[test]
    fn test_level_to_priority() {
        assert_eq!(priority_for_level(95, true), Priority::High);
        assert_eq!(priority_for_level(80, true), Priority::High);
        assert_eq!(priority_for_level(79, true), Priority::Normal);
        assert_eq!(priority_for_level(60, true), Priority::Normal);
        assert_eq!(priority_for_level(59, true), Priority::Low);
        assert_eq!(priority_for_level(95, false), Priority::Low);
    }

    #[test]
    fn test_timer_entry_parsing() {
        let path = Path::new("timers.json");
        let doc = TimerDocument::parse(
            path,
            r#"{"a": {"date": "2026-03-01", "time": "21:30"},
                "b": {"date": "2026-03-01", "time": "待確認"},
                "c": {"time": "10:00"}}"#,
        )
        .unwrap();
        assert_eq!(
            doc.entries["a"].spawn_time().unwrap().format(SPAWN_FORMAT).to_string(),
            "2026-03-01 21:30"
        );
        assert!(doc.entries["b"].spawn_time().is_none());
        assert!(doc.entries["c"].spawn_time().is_none());
        assert!(matches!(
            TimerDocument::parse(path, "[1, 2]"),
            Err(WatcherError::Parse { .. })
        ));
    }

    #[test]
    fn test_window_and_look_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let now = minute_now();
        let ids = ["expired", "active", "soon", "later"];
        let mut board = board(&dir, ids.iter().map(|id| WatchedEvent::new(*id, 90)).collect());
        let doc = doc(&[
            // 开始于 72 分钟前，超出 60 分钟失效窗口
            ("expired", at(now, -70)),
            ("active", at(now, -30)),
            // 开始于 9 分钟后，在提前量之内
            ("soon", at(now, 11)),
            ("later", at(now, 15)),
        ]);

        let tasks = board.evaluate(&doc, now);
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["active", "soon"]);

        let soon = &tasks[1];
        assert_eq!(soon.start_time, now + chrono::Duration::minutes(9));
        assert_eq!(soon.priority, Priority::High);
        assert_eq!(soon.variables.get(EVENT_NAME_VARIABLE).map(String::as_str), Some("soon"));
        assert_eq!(
            soon.mission_id(),
            format!("soon|{}", (now + chrono::Duration::minutes(11)).format(SPAWN_FORMAT))
        );
    }

    #[test]
    fn test_resend_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let now = minute_now();
        let mut board = board(&dir, vec![WatchedEvent::new("dragon", 70)]);
        let doc = doc(&[("dragon", at(now, 5))]);

        let first = board.evaluate(&doc, now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].priority, Priority::Normal);
        assert!(board.evaluate(&doc, now + chrono::Duration::seconds(30)).is_empty());
        assert!(board.evaluate(&doc, now + chrono::Duration::seconds(60)).is_empty());
        assert_eq!(board.evaluate(&doc, now + chrono::Duration::seconds(61)).len(), 1);
    }

    #[test]
    fn test_disabled_and_scriptless_events_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let now = minute_now();
        let mut disabled = WatchedEvent::new("off", 90);
        disabled.enabled = false;
        let mut missing = WatchedEvent::new("missing", 90);
        missing.script = Some(dir.path().join("nope.json"));
        let mut named = WatchedEvent::new("g1", 10);
        named.name = Some("Golem".into());

        let mut board = board(&dir, vec![disabled, missing, named, WatchedEvent::new("unlisted", 0)]);
        let doc = doc(&[
            ("off", at(now, 5)),
            ("missing", at(now, 5)),
            ("g1", at(now, 5)),
            ("stranger", at(now, 5)),
        ]);

        let tasks = board.evaluate(&doc, now);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "Golem");
        assert_eq!(tasks[0].priority, Priority::Low);
    }

    #[test]
    fn test_upcoming_report() {
        let dir = tempfile::tempdir().unwrap();
        let now = minute_now();
        let ids = ["a", "b", "c", "d", "e", "past"];
        let board = board(&dir, ids.iter().map(|id| WatchedEvent::new(*id, 0)).collect());
        let doc = doc(&[
            ("a", at(now, 90)),
            ("b", at(now, 30)),
            ("c", at(now, 200)),
            ("d", at(now, 45)),
            ("e", at(now, 60)),
            ("past", at(now, -5)),
        ]);

        let names: Vec<String> = board.upcoming(&doc, now).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "d", "e"]);
    }

    #[tokio::test]
    async fn test_watcher_pushes_into_queue() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("boss.json");
        std::fs::write(&script, "[]").unwrap();
        let timers = dir.path().join("timers.json");
        let now = Local::now();
        let entry = at(now, 3);
        std::fs::write(
            &timers,
            serde_json::json!({ "dragon": { "date": entry.date, "time": entry.time } }).to_string(),
        )
        .unwrap();

        let queue = Arc::new(ScheduleQueue::new());
        let stop = CancellationToken::new();
        let mut event = WatchedEvent::new("dragon", 85);
        event.name = Some("Red Dragon".into());
        let settings = WatcherSettings {
            timers_file: timers,
            poll: Duration::from_millis(20),
            events: vec![event],
            default_script: Some(script.clone()),
            ..WatcherSettings::default()
        };
        let handle = Watcher::new(queue.clone(), stop.clone(), Journal::default())
            .with_settings(settings)
            .spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // 多轮轮询也只排进一次
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        handle.await.unwrap();

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "Red Dragon");
        assert_eq!(pending[0].script, script);
        assert_eq!(pending[0].priority, Priority::High);
        assert_eq!(
            pending[0].variables.get(EVENT_NAME_VARIABLE).map(String::as_str),
            Some("Red Dragon")
        );
    }

    #[tokio::test]
    async fn test_missing_timer_file_keeps_polling() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::default();
        let mut events = journal.subscribe();
        let stop = CancellationToken::new();
        let settings = WatcherSettings {
            timers_file: dir.path().join("absent.json"),
            poll: Duration::from_millis(10),
            ..WatcherSettings::default()
        };
        let handle = Watcher::new(Arc::new(ScheduleQueue::new()), stop.clone(), journal)
            .with_settings(settings)
            .spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        handle.await.unwrap();

        let mut warnings = 0;
        while let Ok(crate::observability::EngineEvent::Log { message, .. }) = events.try_recv() {
            warnings += usize::from(message.contains("Timer file not found"));
        }
        assert!(warnings >= 2);
    }
}
