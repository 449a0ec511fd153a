//! 错误类型与中断信号
//!
//! 三类错误对应三种处理方式：
//! - `StepError`：步骤参数错误，记录日志后跳过该步骤（可恢复）
//! - `ScriptError`：脚本加载失败 / 嵌套过深，仅终止当前脚本
//! - `Interrupt`：可取消等待的返回值，Stop 需一路退出运行循环，Preempt 只让出当前脚本

use std::path::PathBuf;

use thiserror::Error;

/// 单个步骤的参数错误（不致命）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Malformed step value: {0}")]
    Malformed(String),

    #[error("Missing field '{field}' in {kind} step")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("Unknown step type: {0}")]
    UnknownKind(String),

    #[error("Label not found: {0}")]
    LabelNotFound(String),
}

/// 脚本级错误：只终止当前脚本，调度器继续运行
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Script not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid script document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Script nesting too deep (depth {depth} > {max})")]
    DepthExceeded { depth: usize, max: usize },
}

/// 执行器（串口等）写入失败
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Transport write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("Transport write timed out")]
    Timeout,
}

/// 视觉能力（找图 / OCR / 找色）失败
#[derive(Error, Debug)]
pub enum PerceptionError {
    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Template unreadable: {0}")]
    Template(PathBuf),

    #[error("Recognition failed: {0}")]
    Recognition(String),
}

/// 事件计时文件读取失败
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to read timer file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid timer document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// 宿主门面（`Engine`）的错误
#[derive(Error, Debug)]
pub enum EngineError {
    /// 调度器正在运行，单步测试不能与之并发使用执行器
    #[error("Engine is busy running the scheduler")]
    Busy,

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Run interrupted: {0}")]
    Interrupted(#[from] Interrupt),
}

/// 可取消等待被打断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// 用户或看门狗请求停止：必须退出整个运行循环
    Stop,
    /// 到期的高优先级预约任务插队：只中止当前脚本
    Preempt,
}

impl std::fmt::Display for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interrupt::Stop => write!(f, "stop requested"),
            Interrupt::Preempt => write!(f, "preempted by higher-priority task"),
        }
    }
}

impl std::error::Error for Interrupt {}
