//! 核心层：错误与中断、运行状态、停止信号、引擎门面

pub mod engine;
pub mod error;
pub mod shutdown;
pub mod state;

pub use engine::Engine;
pub use error::{
    EngineError, Interrupt, PerceptionError, ScriptError, StepError, TransportError, WatcherError,
};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{Priority, RunState};
