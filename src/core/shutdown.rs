//! 停止信号与关闭清理
//!
//! Stop 是进程级的取消原因（用户、看门狗或系统信号），与插队（Preempt）相互独立：
//! - 所有可取消等待都监听同一个 token
//! - 关闭原因广播给订阅者（GUI、日志）
//! - 退出前释放执行器上所有按下的键

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::actuator::Actuator;
use crate::core::EngineError;
use crate::observability::Journal;

/// 停止信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 用户点击停止或 Ctrl+C
    UserInitiated,
    /// 看门狗检测到画面长时间静止
    Watchdog,
    /// SIGTERM 信号
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取停止 token（传入每一个可取消等待）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 请求停止；重复请求只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        tracing::warn!(?reason, "Stop requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping run loop...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping run loop...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个清理任务的时限
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

/// 停止后需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> Result<(), EngineError>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务；失败或超时只记日志，不影响后续任务
pub struct ShutdownCoordinator {
    journal: Journal,
    cleanup_tasks: Vec<Box<dyn ShutdownCleanup>>,
}

impl ShutdownCoordinator {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            cleanup_tasks: Vec::new(),
        }
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Box::new(task));
    }

    pub async fn run_cleanup(&self) {
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(CLEANUP_TIMEOUT, task.cleanup()).await {
                Ok(Ok(())) => tracing::debug!("Cleanup '{}' done", name),
                Ok(Err(e)) => self.journal.error(format!("Cleanup '{name}' failed: {e}")),
                Err(_) => self.journal.warn(format!(
                    "Cleanup '{name}' timed out after {}s",
                    CLEANUP_TIMEOUT.as_secs()
                )),
            }
        }
    }
}

/// 停止后松开执行器上所有按键 / 按钮
pub struct ReleaseAllCleanup {
    actuator: Arc<Actuator>,
}

impl ReleaseAllCleanup {
    pub fn new(actuator: Arc<Actuator>) -> Self {
        Self { actuator }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ReleaseAllCleanup {
    async fn cleanup(&self) -> Result<(), EngineError> {
        self.actuator.release_all().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "release_all"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorCommand, VirtualCursor};
    use crate::fatigue::FatigueModel;
    use crate::geometry::{Point, Screen};
    use crate::observability::{EngineEvent, Outcome};

    #[test]
    fn test_stop_cancels_shared_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::Watchdog);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::Watchdog);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::Watchdog);
        assert!(rx.try_recv().is_err());
    }

    struct Hang;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Hang {
        async fn cleanup(&self) -> Result<(), EngineError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "hang"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_cleanup_does_not_block_release() {
        let screen = Screen::new(800, 600);
        let cursor = Arc::new(VirtualCursor::new(screen, Point::new(10, 10)));
        let journal = Journal::default();
        let mut events = journal.subscribe();
        let actuator = Arc::new(Actuator::new(
            cursor.clone(),
            cursor.clone(),
            screen,
            Arc::new(FatigueModel::default()),
            journal.clone(),
        ));

        let mut coordinator = ShutdownCoordinator::new(journal);
        coordinator.register(Hang);
        coordinator.register(ReleaseAllCleanup::new(actuator));
        coordinator.run_cleanup().await;

        assert_eq!(cursor.commands(), vec![ActuatorCommand::ReleaseAll]);
        let mut timed_out = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Log {
                outcome: Outcome::Warning,
                message,
            } = event
            {
                timed_out |= message.contains("'hang' timed out");
            }
        }
        assert!(timed_out);
    }
}
