//! 插件清单
//!
//! 插件目录下每个 `*.toml` 文件可以声明若干插件实例：
//!
//! ```toml
//! [[plugin]]
//! id = "hp_low"
//! builtin = "pixel_mismatch"
//! kind = "predicate"
//!
//! [plugin.params]
//! x = 100
//! y = 30
//! rgb = "255,0,0"
//! tolerance = 30
//! ```
//!
//! 单个文件或单个条目出错只记录日志并跳过。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::builtin;
use super::{PluginError, PluginKind, PluginParams, PluginRegistry};

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub builtin: String,
    pub kind: PluginKind,
    #[serde(default)]
    pub params: toml::Table,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    plugin: Vec<ManifestEntry>,
}

/// 解析一个清单文件
pub fn parse_manifest(path: &Path, content: &str) -> Result<Vec<ManifestEntry>, PluginError> {
    toml::from_str::<ManifestFile>(content)
        .map(|file| file.plugin)
        .map_err(|e| PluginError::InvalidManifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// 按条目实例化并注册；声明的类型必须与内置插件一致
pub fn register_entry(
    registry: &mut PluginRegistry,
    entry: &ManifestEntry,
) -> Result<(), PluginError> {
    let plugin = builtin::instantiate(
        &entry.builtin,
        Some(&entry.id),
        &PluginParams::new(entry.params.clone()),
    )?;
    if plugin.kind() != entry.kind {
        return Err(PluginError::KindMismatch {
            id: entry.id.clone(),
            declared: entry.kind,
            actual: plugin.kind(),
        });
    }
    registry.register(plugin)
}

/// 目录下的清单文件，按文件名排序
pub fn discover(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("*.toml");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(paths) => paths.flatten().collect(),
        Err(e) => {
            tracing::warn!("Invalid plugin directory pattern {}: {}", pattern, e);
            return Vec::new();
        }
    };
    files.sort();
    files
}

/// 加载目录下全部清单，返回成功注册的插件数
pub async fn load_directory(registry: &mut PluginRegistry, dir: &Path) -> usize {
    if !dir.exists() {
        tracing::debug!("Plugin directory {} not found, skipping", dir.display());
        return 0;
    }

    let mut loaded = 0;
    for path in discover(dir) {
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to read plugin manifest {}: {}", path.display(), e);
                continue;
            }
        };
        let entries = match parse_manifest(&path, &content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("{}", e);
                continue;
            }
        };
        for entry in &entries {
            match register_entry(registry, entry) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!("Skipping plugin {}: {}", entry.id, e),
            }
        }
    }

    tracing::info!("Loaded {} plugins from {}", loaded, dir.display());
    loaded
}
