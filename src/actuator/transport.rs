//! 执行器传输层：行协议编码、传输 trait 与模拟模式
//!
//! 协议：`M,dx,dy` 相对移动（单步 ±20）、`C` 点击、`D,code` / `U,code` 按下 / 抬起、`A` 全部释放。
//! 连接失败时退化为模拟模式：时序照常运行，只是不发出任何物理信号。

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::actuator::keys::KeyCode;
use crate::core::TransportError;
use crate::geometry::{Point, Screen};

/// 单次相对移动的最大步幅
pub const MAX_STEP: i32 = 20;

/// 发往执行器的一条指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    Move { dx: i32, dy: i32 },
    Click,
    Down(KeyCode),
    Up(KeyCode),
    ReleaseAll,
}

impl ActuatorCommand {
    /// 相对移动，步幅夹在 ±MAX_STEP 之内
    pub fn step(dx: i32, dy: i32) -> Self {
        ActuatorCommand::Move {
            dx: dx.clamp(-MAX_STEP, MAX_STEP),
            dy: dy.clamp(-MAX_STEP, MAX_STEP),
        }
    }

    pub fn encode(&self) -> String {
        match *self {
            ActuatorCommand::Move { dx, dy } => format!(
                "M,{},{}\n",
                dx.clamp(-MAX_STEP, MAX_STEP),
                dy.clamp(-MAX_STEP, MAX_STEP)
            ),
            ActuatorCommand::Click => "C".to_string(),
            ActuatorCommand::Down(code) => format!("D,{}\n", code.0),
            ActuatorCommand::Up(code) => format!("U,{}\n", code.0),
            ActuatorCommand::ReleaseAll => "A\n".to_string(),
        }
    }
}

/// 底层传输：只有执行器门面会调用它
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, command: ActuatorCommand) -> Result<(), TransportError>;

    /// 清空待读的回传数据，防止旧坐标污染下一次读取
    async fn flush_input(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

/// 光标位置读数
pub trait PositionSensor: Send + Sync {
    fn position(&self) -> Point;
}

/// 模拟模式：丢弃所有指令
#[derive(Debug, Default)]
pub struct SimulatedTransport;

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, command: ActuatorCommand) -> Result<(), TransportError> {
        tracing::trace!(?command, "simulated actuator");
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

/// 写入任意异步字节流（串口设备文件、管道、socket）
pub struct WriterTransport<W> {
    writer: tokio::sync::Mutex<W>,
    write_timeout: Duration,
}

impl<W> WriterTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            write_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[async_trait]
impl<W> Transport for WriterTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, command: ActuatorCommand) -> Result<(), TransportError> {
        let line = command.encode();
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// 打开设备；失败时降级为模拟模式并记录警告
pub async fn connect(device: Option<&Path>) -> Arc<dyn Transport> {
    let Some(path) = device else {
        tracing::info!("No actuator device configured, running in simulated mode");
        return Arc::new(SimulatedTransport);
    };
    match tokio::fs::OpenOptions::new().write(true).open(path).await {
        Ok(file) => {
            tracing::info!(device = %path.display(), "Actuator connected");
            Arc::new(WriterTransport::new(file))
        }
        Err(e) => {
            tracing::warn!(
                device = %path.display(),
                "Actuator connection failed ({}), switching to simulated mode",
                e
            );
            Arc::new(SimulatedTransport)
        }
    }
}

/// 内存中的虚拟光标：同时充当传输与位置传感器，记录收到的指令
#[derive(Debug)]
pub struct VirtualCursor {
    screen: Screen,
    state: Mutex<CursorState>,
}

#[derive(Debug, Default)]
struct CursorState {
    position: Point,
    commands: Vec<ActuatorCommand>,
    flushes: usize,
    /// 外力干扰：每次移动后额外叠加的偏移
    drift: (i32, i32),
}

impl VirtualCursor {
    pub fn new(screen: Screen, start: Point) -> Self {
        Self {
            screen,
            state: Mutex::new(CursorState {
                position: start,
                ..CursorState::default()
            }),
        }
    }

    /// 每次移动后叠加一个固定偏移，模拟外部干扰导致无法到达目标
    pub fn with_drift(self, dx: i32, dy: i32) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.drift = (dx, dy);
        }
        self
    }

    pub fn set_position(&self, p: Point) {
        if let Ok(mut state) = self.state.lock() {
            state.position = p;
        }
    }

    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.state.lock().map(|s| s.commands.clone()).unwrap_or_default()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().map(|s| s.flushes).unwrap_or_default()
    }

    pub fn clear_commands(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.commands.clear();
        }
    }
}

#[async_trait]
impl Transport for VirtualCursor {
    async fn send(&self, command: ActuatorCommand) -> Result<(), TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("virtual cursor poisoned".into()))?;
        if let ActuatorCommand::Move { dx, dy } = command {
            let (drift_x, drift_y) = state.drift;
            let next = state.position.offset(dx + drift_x, dy + drift_y);
            state.position = Point::new(
                next.x.clamp(0, self.screen.width - 1),
                next.y.clamp(0, self.screen.height - 1),
            );
        }
        state.commands.push(command);
        Ok(())
    }

    async fn flush_input(&self) -> Result<(), TransportError> {
        if let Ok(mut state) = self.state.lock() {
            state.flushes += 1;
        }
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

impl PositionSensor for VirtualCursor {
    fn position(&self) -> Point {
        self.state.lock().map(|s| s.position).unwrap_or_default()
    }
}

/// 航位推算：指令照常发往真实设备，同时在虚拟光标上累加位移作为位置读数
pub struct DeadReckoning {
    inner: Arc<dyn Transport>,
    cursor: VirtualCursor,
}

impl DeadReckoning {
    pub fn new(inner: Arc<dyn Transport>, screen: Screen, start: Point) -> Self {
        Self {
            inner,
            cursor: VirtualCursor::new(screen, start),
        }
    }
}

#[async_trait]
impl Transport for DeadReckoning {
    async fn send(&self, command: ActuatorCommand) -> Result<(), TransportError> {
        self.inner.send(command).await?;
        self.cursor.send(command).await
    }

    async fn flush_input(&self) -> Result<(), TransportError> {
        self.inner.flush_input().await
    }

    fn is_simulated(&self) -> bool {
        self.inner.is_simulated()
    }
}

impl PositionSensor for DeadReckoning {
    fn position(&self) -> Point {
        self.cursor.position()
    }
}
