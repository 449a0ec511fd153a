//! 脚本：有序的步骤记录列表
//!
//! 文件格式为 JSON 数组 `[{ "type": "Click", "val": "100,200", "text": "..." }]`，
//! `val` 可以是字符串或数字。记录保持原样存储，`{VAR}` 占位符在执行时才替换，
//! 替换之后再解码为类型化的 [`Step`]。

pub mod step;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::{ScriptError, StepError};

pub use step::{Branch, Condition, ExceedAction, Pacing, SmartAction, Step, StepKind};

/// 绑定到一次执行的变量
pub type Variables = HashMap<String, String>;

/// 脚本文件中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "val", default, deserialize_with = "string_or_number")]
    pub value: String,

    /// 编辑器显示用的说明文字
    #[serde(default)]
    pub text: String,
}

impl StepRecord {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
            text: String::new(),
        }
    }

    pub fn from_step(step: &Step) -> Self {
        Self::new(step.kind().as_str(), step.encode())
    }

    pub fn is_label(&self, name: &str) -> bool {
        self.kind == StepKind::Label.as_str() && self.value == name
    }

    /// 代入变量后解码
    pub fn resolve(&self, variables: &Variables) -> Result<Step, StepError> {
        let kind: StepKind = self.kind.parse()?;
        let value = substitute(&self.value, variables);
        Step::decode(kind, &value)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
        Null(()),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
        Raw::Null(()) => String::new(),
    })
}

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

/// 把 `{KEY}` 替换为变量值；未知的占位符原样保留
pub fn substitute(value: &str, variables: &Variables) -> String {
    if variables.is_empty() || !value.contains('{') {
        return value.to_string();
    }
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("valid regex"));
    re.replace_all(value, |caps: &Captures| match variables.get(&caps[1]) {
        Some(v) => v.clone(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// 一个已加载的脚本
#[derive(Debug, Clone, Default)]
pub struct Script {
    path: Option<PathBuf>,
    records: Vec<StepRecord>,
}

impl Script {
    pub fn new(records: Vec<StepRecord>) -> Self {
        Self {
            path: None,
            records,
        }
    }

    pub fn from_steps(steps: &[Step]) -> Self {
        Self::new(steps.iter().map(StepRecord::from_step).collect())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ScriptError::NotFound(path.to_path_buf())
            } else {
                ScriptError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let records: Vec<StepRecord> =
            serde_json::from_str(&content).map_err(|source| ScriptError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!(path = %path.display(), steps = records.len(), "Script loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            records,
        })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&self.records).map_err(|source| {
            ScriptError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ScriptError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// 日志中显示的名称（文件名）
    pub fn name(&self) -> String {
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<inline>".to_string())
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 第一个名字完全相同的 Label
    pub fn find_label(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|r| r.is_label(name))
    }
}
