//! Drone 无头宿主
//!
//! 加载配置、装配引擎，运行调度循环直到 Ctrl+C / SIGTERM / 看门狗停止。
//! 用法：`drone [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use drone::{config::load_config, observability, perception::ScriptedPerception, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;

    // 无头宿主不带识别后端：找图 / OCR / 找色一律未命中
    let perception = Arc::new(ScriptedPerception::new());
    let engine = Engine::from_config(&config, perception)
        .await
        .context("Failed to assemble engine")?;

    tracing::info!(
        plugins = engine.plugins().len(),
        tasks = config.tasks.len(),
        "Engine ready"
    );

    engine.shutdown_manager().install_signal_handlers();
    engine.run().await;

    Ok(())
}
