//! 步骤编解码：脚本文件里的 `type` + `val` 字符串 <-> 类型化的 [`Step`]
//!
//! 多字段的值用 `|` 分隔，可选的搜索区域以 `|x,y,w,h` 结尾，例如：
//! - `FindImg`：`boss.png|0,0,100,100`
//! - `IfImage`：`boss.png|0,0,100,100|LABEL` 或 `boss.png|LABEL`
//! - `Loop`：`LABEL|3|Stop` 或 `LABEL|3|Goto|RECOVER`
//! - `SmartAction`：`cond|target|succAct|succParam|failAct|failParam|threshold|region`

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::actuator::KeyCode;
use crate::core::StepError;
use crate::geometry::{Point, Region, Rgb};

/// 步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Label,
    Goto,
    Loop,
    Click,
    Wait,
    Key,
    Drag,
    FindImg,
    Ocr,
    FindColor,
    IfImage,
    SmartAction,
    LogicPlugin,
    Plugin,
    Comment,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Label => "Label",
            StepKind::Goto => "Goto",
            StepKind::Loop => "Loop",
            StepKind::Click => "Click",
            StepKind::Wait => "Wait",
            StepKind::Key => "Key",
            StepKind::Drag => "Drag",
            StepKind::FindImg => "FindImg",
            StepKind::Ocr => "OCR",
            StepKind::FindColor => "FindColor",
            StepKind::IfImage => "IfImage",
            StepKind::SmartAction => "SmartAction",
            StepKind::LogicPlugin => "LogicPlugin",
            StepKind::Plugin => "Plugin",
            StepKind::Comment => "Comment",
        }
    }

    /// 步骤后的间隔档位
    pub fn pacing(self) -> Pacing {
        match self {
            StepKind::FindImg
            | StepKind::Ocr
            | StepKind::FindColor
            | StepKind::SmartAction
            | StepKind::IfImage => Pacing::Perception,
            StepKind::Click | StepKind::Key | StepKind::Drag => Pacing::Input,
            StepKind::Label | StepKind::Goto | StepKind::Loop | StepKind::Comment => {
                Pacing::ControlFlow
            }
            StepKind::Wait | StepKind::LogicPlugin | StepKind::Plugin => Pacing::Default,
        }
    }
}

impl FromStr for StepKind {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "Label" => StepKind::Label,
            "Goto" => StepKind::Goto,
            "Loop" => StepKind::Loop,
            "Click" => StepKind::Click,
            "Wait" => StepKind::Wait,
            "Key" => StepKind::Key,
            "Drag" => StepKind::Drag,
            "FindImg" => StepKind::FindImg,
            "OCR" => StepKind::Ocr,
            "FindColor" => StepKind::FindColor,
            "IfImage" => StepKind::IfImage,
            "SmartAction" => StepKind::SmartAction,
            "LogicPlugin" | "LogicPluginRef" => StepKind::LogicPlugin,
            "Plugin" | "PluginRef" => StepKind::Plugin,
            "Comment" => StepKind::Comment,
            other => return Err(StepError::UnknownKind(other.to_string())),
        };
        Ok(kind)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤后间隔的档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// 识别类：0.5 ~ 0.8 秒
    Perception,
    /// 输入类：0.1 ~ 0.3 秒
    Input,
    /// 流程控制：10 毫秒
    ControlFlow,
    /// 其余：0.1 秒
    Default,
}

/// 循环超限后的处理
#[derive(Debug, Clone, PartialEq)]
pub enum ExceedAction {
    Stop,
    Goto(String),
}

/// SmartAction 的判断条件
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Image(PathBuf),
    Text(String),
    Color(Rgb),
}

/// SmartAction 单个分支的动作
#[derive(Debug, Clone, PartialEq)]
pub enum Branch {
    ClickTarget,
    ClickOffset { dx: i32, dy: i32 },
    RunScript(PathBuf),
    Goto(String),
    Stop,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmartAction {
    pub condition: Condition,
    pub on_success: Branch,
    pub on_failure: Branch,
    /// 找图置信度 / OCR 相似度（0~1）或找色容差（0~100）
    pub threshold: f64,
    pub region: Option<Region>,
}

/// 默认的 SmartAction 阈值（无法解析时使用）
pub const DEFAULT_SMART_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Label(String),
    Goto(String),
    Loop {
        label: String,
        max_count: u32,
        on_exceed: ExceedAction,
    },
    Click(Point),
    Wait(f64),
    Key(KeyCode),
    Drag {
        from: Point,
        to: Point,
    },
    FindImg {
        template: PathBuf,
        region: Option<Region>,
    },
    Ocr {
        text: String,
        region: Option<Region>,
    },
    FindColor {
        color: Rgb,
        region: Option<Region>,
    },
    IfImage {
        template: PathBuf,
        region: Option<Region>,
        label: String,
    },
    SmartAction(SmartAction),
    LogicPlugin {
        plugin: String,
        label: String,
    },
    Plugin(String),
    Comment,
}

impl Step {
    pub fn decode(kind: StepKind, value: &str) -> Result<Step, StepError> {
        let step = match kind {
            StepKind::Label => Step::Label(value.to_string()),
            StepKind::Goto => Step::Goto(value.to_string()),
            StepKind::Loop => decode_loop(value)?,
            StepKind::Click => Step::Click(value.parse()?),
            StepKind::Wait => Step::Wait(decode_wait(value)?),
            StepKind::Key => Step::Key(
                value
                    .parse()
                    .map_err(|_| StepError::Malformed(format!("key code: '{value}'")))?,
            ),
            StepKind::Drag => {
                let (from, to) = value
                    .split_once('|')
                    .ok_or(StepError::MissingField { kind: "Drag", field: "end" })?;
                Step::Drag {
                    from: from.parse()?,
                    to: to.parse()?,
                }
            }
            StepKind::FindImg => {
                let (main, region) = split_region(value);
                non_empty(main, "FindImg", "template")?;
                Step::FindImg {
                    template: PathBuf::from(main),
                    region,
                }
            }
            StepKind::Ocr => {
                let (main, region) = split_region(value);
                let text = main.trim();
                non_empty(text, "OCR", "text")?;
                Step::Ocr {
                    text: text.to_string(),
                    region,
                }
            }
            StepKind::FindColor => {
                let (main, region) = split_region(value);
                Step::FindColor {
                    color: main.parse()?,
                    region,
                }
            }
            StepKind::IfImage => decode_if_image(value)?,
            StepKind::SmartAction => Step::SmartAction(decode_smart(value)?),
            StepKind::LogicPlugin => {
                let (plugin, label) = value
                    .split_once('|')
                    .ok_or(StepError::MissingField { kind: "LogicPlugin", field: "label" })?;
                non_empty(plugin, "LogicPlugin", "plugin")?;
                Step::LogicPlugin {
                    plugin: plugin.to_string(),
                    label: label.to_string(),
                }
            }
            StepKind::Plugin => {
                non_empty(value, "Plugin", "plugin")?;
                Step::Plugin(value.to_string())
            }
            StepKind::Comment => Step::Comment,
        };
        Ok(step)
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Label(_) => StepKind::Label,
            Step::Goto(_) => StepKind::Goto,
            Step::Loop { .. } => StepKind::Loop,
            Step::Click(_) => StepKind::Click,
            Step::Wait(_) => StepKind::Wait,
            Step::Key(_) => StepKind::Key,
            Step::Drag { .. } => StepKind::Drag,
            Step::FindImg { .. } => StepKind::FindImg,
            Step::Ocr { .. } => StepKind::Ocr,
            Step::FindColor { .. } => StepKind::FindColor,
            Step::IfImage { .. } => StepKind::IfImage,
            Step::SmartAction(_) => StepKind::SmartAction,
            Step::LogicPlugin { .. } => StepKind::LogicPlugin,
            Step::Plugin(_) => StepKind::Plugin,
            Step::Comment => StepKind::Comment,
        }
    }

    /// 编码回脚本文件中的字符串形式
    pub fn encode(&self) -> String {
        match self {
            Step::Label(name) | Step::Goto(name) => name.clone(),
            Step::Loop {
                label,
                max_count,
                on_exceed,
            } => match on_exceed {
                ExceedAction::Stop => format!("{label}|{max_count}|Stop"),
                ExceedAction::Goto(target) => format!("{label}|{max_count}|Goto|{target}"),
            },
            Step::Click(p) => format!("{},{}", p.x, p.y),
            Step::Wait(secs) => secs.to_string(),
            Step::Key(code) => code.0.to_string(),
            Step::Drag { from, to } => format!("{},{}|{},{}", from.x, from.y, to.x, to.y),
            Step::FindImg { template, region } => {
                with_region(template.display().to_string(), *region)
            }
            Step::Ocr { text, region } => with_region(text.clone(), *region),
            Step::FindColor { color, region } => with_region(color.to_string(), *region),
            Step::IfImage {
                template,
                region,
                label,
            } => match region {
                Some(r) => format!("{}|{r}|{label}", template.display()),
                None => format!("{}|{label}", template.display()),
            },
            Step::SmartAction(smart) => encode_smart(smart),
            Step::LogicPlugin { plugin, label } => format!("{plugin}|{label}"),
            Step::Plugin(name) => name.clone(),
            Step::Comment => String::new(),
        }
    }
}

/// 单个 Wait 步骤允许的最长秒数
pub const MAX_WAIT_SECS: f64 = 86_400.0;

fn decode_wait(value: &str) -> Result<f64, StepError> {
    let malformed = || StepError::Malformed(format!("wait seconds: '{value}'"));
    let secs: f64 = value.trim().parse().map_err(|_| malformed())?;
    if !secs.is_finite() || secs > MAX_WAIT_SECS {
        return Err(malformed());
    }
    Ok(secs)
}

/// 拆出结尾的 `|x,y,w,h` 区域
pub fn split_region(value: &str) -> (&str, Option<Region>) {
    if let Some((main, tail)) = value.rsplit_once('|') {
        if let Some(region) = Region::parse_suffix(tail) {
            return (main, Some(region));
        }
    }
    (value, None)
}

fn with_region(main: String, region: Option<Region>) -> String {
    match region {
        Some(r) => format!("{main}|{r}"),
        None => main,
    }
}

fn non_empty(value: &str, kind: &'static str, field: &'static str) -> Result<(), StepError> {
    if value.trim().is_empty() {
        Err(StepError::MissingField { kind, field })
    } else {
        Ok(())
    }
}

fn decode_loop(value: &str) -> Result<Step, StepError> {
    let parts: Vec<&str> = value.split('|').collect();
    let label = parts[0];
    non_empty(label, "Loop", "label")?;
    let max_count = parts
        .get(1)
        .ok_or(StepError::MissingField { kind: "Loop", field: "count" })?
        .trim()
        .parse::<u32>()
        .map_err(|_| StepError::Malformed(format!("loop count: '{value}'")))?;
    let on_exceed = match parts.get(2).map(|s| s.trim()) {
        None | Some("") | Some("Stop") => ExceedAction::Stop,
        Some("Goto") => {
            let target = parts.get(3).copied().unwrap_or_default();
            non_empty(target, "Loop", "recovery label")?;
            ExceedAction::Goto(target.to_string())
        }
        Some(other) => {
            return Err(StepError::Malformed(format!("loop exceed action: '{other}'")));
        }
    };
    Ok(Step::Loop {
        label: label.to_string(),
        max_count,
        on_exceed,
    })
}

fn decode_if_image(value: &str) -> Result<Step, StepError> {
    let parts: Vec<&str> = value.split('|').collect();
    if parts.len() < 2 {
        return Err(StepError::MissingField { kind: "IfImage", field: "label" });
    }
    let template = parts[0];
    non_empty(template, "IfImage", "template")?;
    let label = parts[parts.len() - 1];
    let region = if parts.len() > 2 {
        Region::parse_suffix(parts[1])
    } else {
        None
    };
    Ok(Step::IfImage {
        template: PathBuf::from(template),
        region,
        label: label.to_string(),
    })
}

fn decode_branch(action: &str, param: &str) -> Result<Branch, StepError> {
    let branch = match action.trim() {
        "" | "Continue" | "None" => Branch::Continue,
        "ClickTarget" => Branch::ClickTarget,
        "ClickOffset" => {
            let offset: Point = param.parse()?;
            Branch::ClickOffset {
                dx: offset.x,
                dy: offset.y,
            }
        }
        "RunScript" => {
            non_empty(param, "SmartAction", "script")?;
            Branch::RunScript(PathBuf::from(param))
        }
        "Goto" => {
            non_empty(param, "SmartAction", "label")?;
            Branch::Goto(param.to_string())
        }
        "Stop" => Branch::Stop,
        other => return Err(StepError::Malformed(format!("smart action: '{other}'"))),
    };
    Ok(branch)
}

fn encode_branch(branch: &Branch) -> (&'static str, String) {
    match branch {
        Branch::ClickTarget => ("ClickTarget", String::new()),
        Branch::ClickOffset { dx, dy } => ("ClickOffset", format!("{dx},{dy}")),
        Branch::RunScript(path) => ("RunScript", path.display().to_string()),
        Branch::Goto(label) => ("Goto", label.clone()),
        Branch::Stop => ("Stop", String::new()),
        Branch::Continue => ("Continue", String::new()),
    }
}

fn decode_smart(value: &str) -> Result<SmartAction, StepError> {
    let mut parts: Vec<&str> = value.split('|').collect();
    let mut region = None;
    if let Some(last) = parts.last() {
        if let Some(r) = Region::parse_suffix(last) {
            region = Some(r);
            parts.pop();
        }
    }
    let field = |i: usize| parts.get(i).copied().unwrap_or_default();

    let target = field(1);
    let condition = match field(0).trim() {
        "FindImg" => {
            non_empty(target, "SmartAction", "template")?;
            Condition::Image(PathBuf::from(target))
        }
        "OCR" => {
            non_empty(target, "SmartAction", "text")?;
            Condition::Text(target.to_string())
        }
        "FindColor" => Condition::Color(target.parse()?),
        "" => return Err(StepError::MissingField { kind: "SmartAction", field: "condition" }),
        other => return Err(StepError::Malformed(format!("smart condition: '{other}'"))),
    };

    Ok(SmartAction {
        condition,
        on_success: decode_branch(field(2), field(3))?,
        on_failure: decode_branch(field(4), field(5))?,
        threshold: field(6).trim().parse().unwrap_or(DEFAULT_SMART_THRESHOLD),
        region,
    })
}

fn encode_smart(smart: &SmartAction) -> String {
    let (cond, target) = match &smart.condition {
        Condition::Image(path) => ("FindImg", path.display().to_string()),
        Condition::Text(text) => ("OCR", text.clone()),
        Condition::Color(rgb) => ("FindColor", rgb.to_string()),
    };
    let (succ, succ_param) = encode_branch(&smart.on_success);
    let (fail, fail_param) = encode_branch(&smart.on_failure);
    let base = format!(
        "{cond}|{target}|{succ}|{succ_param}|{fail}|{fail_param}|{}",
        smart.threshold
    );
    with_region(base, smart.region)
}
