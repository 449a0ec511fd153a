//! 引擎门面：把执行器、视觉、插件、调度队列、调度器、看门狗、事件监控与停止信号装配在一起
//!
//! 宿主（无头进程或 GUI）只接触这里：
//! - `queue()`：外部生产者推入预约任务
//! - `events()`：订阅日志与绘制通知
//! - `run()`：运行调度循环直到停止
//! - `test_step()`：单步测试，与调度循环互斥

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::actuator::{connect, Actuator, DeadReckoning, PositionSensor, Transport};
use crate::config::AppConfig;
use crate::core::shutdown::{ReleaseAllCleanup, ShutdownCoordinator};
use crate::core::{EngineError, RunState, ShutdownManager, ShutdownReason};
use crate::fatigue::FatigueModel;
use crate::geometry::Point;
use crate::interpreter::{Interpreter, RunOutcome};
use crate::observability::{EngineEvent, Journal};
use crate::perception::Perception;
use crate::plugins::{load_directory, EngineHandle, PluginMetadata, PluginRegistry};
use crate::scheduler::{ScheduleQueue, Scheduler, Waiter};
use crate::script::{StepRecord, Variables};
use crate::watchdog::{Watchdog, WatchdogSettings};
use crate::watcher::{Watcher, WatcherSettings};

pub struct Engine {
    shutdown: Arc<ShutdownManager>,
    journal: Journal,
    queue: Arc<ScheduleQueue>,
    actuator: Arc<Actuator>,
    perception: Arc<dyn Perception>,
    interpreter: Arc<Interpreter>,
    plugins: Arc<PluginRegistry>,
    /// 同时充当工作线程锁：持有者独占执行器
    scheduler: Mutex<Scheduler>,
    watchdog: Option<WatchdogSettings>,
    watcher: Option<WatcherSettings>,
}

impl Engine {
    /// 用给定的传输、位置传感器与视觉能力装配引擎
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn Transport>,
        sensor: Arc<dyn PositionSensor>,
        perception: Arc<dyn Perception>,
        plugins: PluginRegistry,
    ) -> Result<Self, EngineError> {
        let tasks = config.recurring_tasks()?;
        let shutdown = Arc::new(ShutdownManager::new());
        let journal = Journal::default();
        let queue = Arc::new(ScheduleQueue::with_history(config.scheduler.executed_history));
        let fatigue = Arc::new(FatigueModel::new(config.fatigue.cutoff()));

        let actuator = Arc::new(Actuator::new(
            transport,
            sensor,
            config.screen.screen(),
            fatigue,
            journal.clone(),
        ));
        let waiter = Waiter::new(
            shutdown.token(),
            queue.clone(),
            Arc::new(RunState::new()),
            journal.clone(),
        )
        .with_tick(config.scheduler.tick())
        .with_idle_motion(actuator.clone());

        let plugins = Arc::new(plugins);
        let handle = EngineHandle::new(actuator.clone(), perception.clone(), journal.clone(), waiter);
        let interpreter = Arc::new(
            Interpreter::new(handle, plugins.clone())
                .with_max_depth(config.scheduler.max_script_depth),
        );
        let scheduler = Scheduler::new(interpreter.clone(), tasks)
            .with_settings(config.scheduler.settings());

        Ok(Self {
            shutdown,
            journal,
            queue,
            actuator,
            perception,
            interpreter,
            plugins,
            scheduler: Mutex::new(scheduler),
            watchdog: config
                .watchdog
                .enabled
                .then(|| config.watchdog.settings()),
            watcher: config.watcher.enabled.then(|| config.watcher.settings()),
        })
    }

    /// 按配置连接执行器（失败降级为模拟）、加载插件清单
    pub async fn from_config(
        config: &AppConfig,
        perception: Arc<dyn Perception>,
    ) -> Result<Self, EngineError> {
        let screen = config.screen.screen();
        let start = Point::new(screen.width / 2, screen.height / 2);
        let device = connect(config.transport.device.as_deref()).await;
        let tracked = Arc::new(DeadReckoning::new(device, screen, start));

        let mut plugins = PluginRegistry::with_builtins();
        load_directory(&mut plugins, &config.plugins.directory).await;

        Self::new(config, tracked.clone(), tracked, perception, plugins)
    }

    pub fn queue(&self) -> &Arc<ScheduleQueue> {
        &self.queue
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.journal.subscribe()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn actuator(&self) -> &Arc<Actuator> {
        &self.actuator
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn plugins(&self) -> Vec<PluginMetadata> {
        self.plugins.list()
    }

    /// 用户请求停止
    pub fn stop(&self) {
        self.shutdown.shutdown(ShutdownReason::UserInitiated);
    }

    /// 运行调度循环直到停止，然后松开所有按键
    pub async fn run(&self) {
        let mut scheduler = self.scheduler.lock().await;
        if self.actuator.is_simulated() {
            self.journal
                .warn("Actuator in simulated mode, no physical input will be sent");
        }

        let watchdog = self.watchdog.clone().map(|settings| {
            Watchdog::new(self.perception.clone(), self.shutdown.clone(), self.journal.clone())
                .with_settings(settings)
                .spawn()
        });

        let watcher = self.watcher.clone().map(|settings| {
            Watcher::new(self.queue.clone(), self.shutdown.token(), self.journal.clone())
                .with_settings(settings)
                .spawn()
        });

        scheduler.run().await;

        let mut cleanup = ShutdownCoordinator::new(self.journal.clone());
        cleanup.register(ReleaseAllCleanup::new(self.actuator.clone()));
        cleanup.run_cleanup().await;

        if let Some(handle) = watchdog {
            if let Err(e) = handle.await {
                tracing::warn!("Watchdog task ended abnormally: {}", e);
            }
        }
        if let Some(handle) = watcher {
            if let Err(e) = handle.await {
                tracing::warn!("Event watcher task ended abnormally: {}", e);
            }
        }
    }

    /// 单步测试；调度循环运行时返回 `Busy`
    pub async fn test_step(&self, record: &StepRecord) -> Result<RunOutcome, EngineError> {
        let _worker = self.scheduler.try_lock().map_err(|_| EngineError::Busy)?;
        let variables = Variables::new();
        let step = record.resolve(&variables)?;
        self.journal.info(format!("Testing step {}", record.kind));
        Ok(self.interpreter.run_step(&step, &variables).await?)
    }
}
