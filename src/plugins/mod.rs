//! 插件系统
//!
//! 两种固定接口：
//! - 动作插件 [`ActionPlugin`]：`Plugin` 步骤执行 `run`
//! - 判断插件 [`PredicatePlugin`]：`LogicPlugin` 步骤执行 `check`，结果决定是否跳转
//!
//! 插件在注册时校验接口类型；脚本按名称引用，`human_idle.py` 这类文件名按主干名查找。

pub mod builtin;
pub mod manifest;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::actuator::Actuator;
use crate::core::{Interrupt, PerceptionError, TransportError};
use crate::observability::Journal;
use crate::perception::Perception;
use crate::scheduler::Waiter;

pub use manifest::load_directory;

/// 插件元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// 插件唯一标识（脚本中引用的名称）
    pub id: String,
    /// 显示名称
    pub name: String,
    pub description: String,
    pub kind: PluginKind,
}

impl PluginMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: PluginKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// 插件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Action,
    Predicate,
}

/// 清单中给插件的参数
#[derive(Debug, Clone, Default)]
pub struct PluginParams {
    values: toml::Table,
}

impl PluginParams {
    pub fn new(values: toml::Table) -> Self {
        Self { values }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values.get(key).and_then(|v| v.clone().try_into().ok())
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }
}

/// 插件错误
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Unknown builtin plugin: {0}")]
    UnknownBuiltin(String),

    #[error("Plugin {id} is a {actual:?} plugin, manifest declares {declared:?}")]
    KindMismatch {
        id: String,
        declared: PluginKind,
        actual: PluginKind,
    },

    #[error("Invalid plugin manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("Plugin configuration error: {0}")]
    ConfigError(String),

    #[error("Plugin execution failed: {0}")]
    ExecutionFailed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Perception(#[from] PerceptionError),

    /// 插件内部的可取消等待被打断，需要原样上抛
    #[error("Plugin interrupted: {0}")]
    Interrupted(#[from] Interrupt),
}

/// 插件能访问的引擎能力
#[derive(Clone)]
pub struct EngineHandle {
    actuator: Arc<Actuator>,
    perception: Arc<dyn Perception>,
    journal: Journal,
    waiter: Waiter,
}

impl EngineHandle {
    pub fn new(
        actuator: Arc<Actuator>,
        perception: Arc<dyn Perception>,
        journal: Journal,
        waiter: Waiter,
    ) -> Self {
        Self {
            actuator,
            perception,
            journal,
            waiter,
        }
    }

    pub fn actuator(&self) -> &Arc<Actuator> {
        &self.actuator
    }

    pub fn perception(&self) -> &Arc<dyn Perception> {
        &self.perception
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    pub fn log(&self, message: impl Into<String>) {
        self.journal.info(message);
    }

    pub fn should_stop(&self) -> bool {
        self.waiter.should_stop()
    }

    /// 可取消的暂停
    pub async fn pause(&self, duration: Duration) -> Result<(), PluginError> {
        self.waiter.sleep(duration).await.map_err(PluginError::from)
    }
}

#[async_trait]
pub trait ActionPlugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    async fn run(&self, engine: &EngineHandle) -> Result<(), PluginError>;
}

#[async_trait]
pub trait PredicatePlugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    async fn check(&self, engine: &EngineHandle) -> Result<bool, PluginError>;
}

/// 插件注册表
#[derive(Default)]
pub struct PluginRegistry {
    actions: HashMap<String, Arc<dyn ActionPlugin>>,
    predicates: HashMap<String, Arc<dyn PredicatePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部内置插件（使用默认参数）
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for id in builtin::CATALOG {
            let result = builtin::instantiate(id, None, &PluginParams::default())
                .and_then(|plugin| registry.register(plugin));
            if let Err(e) = result {
                tracing::error!("Failed to register builtin plugin {}: {}", id, e);
            }
        }
        registry
    }

    fn ensure_free(&self, id: &str) -> Result<(), PluginError> {
        if self.actions.contains_key(id) || self.predicates.contains_key(id) {
            return Err(PluginError::AlreadyRegistered(id.to_string()));
        }
        Ok(())
    }

    pub fn register(&mut self, plugin: builtin::Registered) -> Result<(), PluginError> {
        match plugin {
            builtin::Registered::Action(p) => self.register_action(p),
            builtin::Registered::Predicate(p) => self.register_predicate(p),
        }
    }

    /// 注册动作插件
    pub fn register_action(&mut self, plugin: Arc<dyn ActionPlugin>) -> Result<(), PluginError> {
        let meta = plugin.metadata();
        if meta.kind != PluginKind::Action {
            return Err(PluginError::KindMismatch {
                id: meta.id.clone(),
                declared: PluginKind::Action,
                actual: meta.kind,
            });
        }
        let id = meta.id.clone();
        self.ensure_free(&id)?;
        tracing::debug!("Registered action plugin: {}", id);
        self.actions.insert(id, plugin);
        Ok(())
    }

    /// 注册判断插件
    pub fn register_predicate(
        &mut self,
        plugin: Arc<dyn PredicatePlugin>,
    ) -> Result<(), PluginError> {
        let meta = plugin.metadata();
        if meta.kind != PluginKind::Predicate {
            return Err(PluginError::KindMismatch {
                id: meta.id.clone(),
                declared: PluginKind::Predicate,
                actual: meta.kind,
            });
        }
        let id = meta.id.clone();
        self.ensure_free(&id)?;
        tracing::debug!("Registered predicate plugin: {}", id);
        self.predicates.insert(id, plugin);
        Ok(())
    }

    pub fn action(&self, reference: &str) -> Result<Arc<dyn ActionPlugin>, PluginError> {
        self.actions
            .get(lookup_key(reference))
            .cloned()
            .ok_or_else(|| PluginError::NotFound(reference.to_string()))
    }

    pub fn predicate(&self, reference: &str) -> Result<Arc<dyn PredicatePlugin>, PluginError> {
        self.predicates
            .get(lookup_key(reference))
            .cloned()
            .ok_or_else(|| PluginError::NotFound(reference.to_string()))
    }

    /// 所有插件的元数据，按 id 排序
    pub fn list(&self) -> Vec<PluginMetadata> {
        let mut all: Vec<PluginMetadata> = self
            .actions
            .values()
            .map(|p| p.metadata().clone())
            .chain(self.predicates.values().map(|p| p.metadata().clone()))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.actions.len() + self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `extensions/human_idle.py` -> `human_idle`
fn lookup_key(reference: &str) -> &str {
    let trimmed = reference.trim();
    Path::new(trimmed)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(trimmed)
}
