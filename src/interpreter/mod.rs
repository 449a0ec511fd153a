//! 脚本解释器
//!
//! 以程序计数器遍历步骤列表。可恢复的问题（参数格式错、没找到目标、标签不存在、插件缺失）
//! 只记录日志然后继续；只有停止与插队通过 [`Interrupt`] 向上传递。
//!
//! 每一步之前检查一次中断；每一步之后按步骤类型插入拟人化间隔，间隔同样可被打断。

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::core::{Interrupt, ScriptError};
use crate::geometry::{Point, Region};
use crate::perception::{
    is_text_match, OcrHit, DEFAULT_COLOR_TOLERANCE, DEFAULT_IMAGE_CONFIDENCE,
    DEFAULT_OCR_SIMILARITY,
};
use crate::plugins::{EngineHandle, PluginError, PluginRegistry};
use crate::script::{
    Branch, Condition, ExceedAction, Pacing, Script, SmartAction, Step, StepKind, Variables,
};

/// 子脚本最大嵌套层数
pub const MAX_SCRIPT_DEPTH: usize = 3;

/// 移动到识别目标后、点击前的停顿
const SETTLE_BEFORE_CLICK: Duration = Duration::from_millis(150);

/// 一次脚本执行的结果（停止与插队走 `Err(Interrupt)`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 走完了全部步骤
    Completed,
    /// 被 Stop 动作（SmartAction / 循环超限）终止
    Halted,
    /// 脚本无法加载或嵌套过深，一步都没执行
    Failed,
}

enum Flow {
    Next,
    Jump(usize),
    Halt,
}

/// 一次顶层执行的状态；子脚本共享同一份
struct RunContext<'v> {
    variables: &'v Variables,
    loop_counters: HashMap<String, u32>,
}

type Pending<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct Interpreter {
    engine: EngineHandle,
    plugins: Arc<PluginRegistry>,
    max_depth: usize,
}

impl Interpreter {
    pub fn new(engine: EngineHandle, plugins: Arc<PluginRegistry>) -> Self {
        Self {
            engine,
            plugins,
            max_depth: MAX_SCRIPT_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// 加载并执行脚本文件；加载失败记录日志并返回 `Failed`
    pub async fn run_file(
        &self,
        path: &Path,
        variables: &Variables,
    ) -> Result<RunOutcome, Interrupt> {
        match Script::load(path).await {
            Ok(script) => self.run(&script, variables).await,
            Err(e) => {
                self.engine.journal().error(e.to_string());
                Ok(RunOutcome::Failed)
            }
        }
    }

    /// 执行一个脚本；循环计数器在每次顶层执行时重置
    pub async fn run(&self, script: &Script, variables: &Variables) -> Result<RunOutcome, Interrupt> {
        let mut ctx = RunContext {
            variables,
            loop_counters: HashMap::new(),
        };
        self.execute(script, &mut ctx, 0).await
    }

    /// 单步执行（编辑器里的"测试此步骤"），没有步骤后间隔
    pub async fn run_step(&self, step: &Step, variables: &Variables) -> Result<RunOutcome, Interrupt> {
        let script = Script::from_steps(std::slice::from_ref(step));
        let mut ctx = RunContext {
            variables,
            loop_counters: HashMap::new(),
        };
        match self.perform(&script, step, &mut ctx, 0).await? {
            Flow::Halt => Ok(RunOutcome::Halted),
            Flow::Next | Flow::Jump(_) => Ok(RunOutcome::Completed),
        }
    }

    fn execute<'a, 'v: 'a>(
        &'a self,
        script: &'a Script,
        ctx: &'a mut RunContext<'v>,
        depth: usize,
    ) -> Pending<'a, Result<RunOutcome, Interrupt>> {
        Box::pin(async move {
            let journal = self.engine.journal();
            if depth > self.max_depth {
                let e = ScriptError::DepthExceeded {
                    depth,
                    max: self.max_depth,
                };
                journal.error(format!("{e}, not running {}", script.name()));
                return Ok(RunOutcome::Failed);
            }

            let mut i = 0;
            while i < script.len() {
                if let Err(interrupt) = self.engine.waiter().check() {
                    if interrupt == Interrupt::Preempt {
                        journal.warn(format!("{} interrupted, yielding to urgent task", script.name()));
                    }
                    return Err(interrupt);
                }

                let record = &script.records()[i];
                let kind = record.kind.parse::<StepKind>().ok();
                let flow = match record.resolve(ctx.variables) {
                    Ok(step) => self.perform(script, &step, ctx, depth).await?,
                    Err(e) => {
                        journal.error(format!("Step {} ({}) skipped: {}", i + 1, record.kind, e));
                        Flow::Next
                    }
                };

                match flow {
                    Flow::Next => i += 1,
                    Flow::Jump(target) => i = target,
                    Flow::Halt => return Ok(RunOutcome::Halted),
                }

                self.pace(kind.map_or(Pacing::Default, StepKind::pacing)).await?;
            }
            Ok(RunOutcome::Completed)
        })
    }

    async fn perform(
        &self,
        script: &Script,
        step: &Step,
        ctx: &mut RunContext<'_>,
        depth: usize,
    ) -> Result<Flow, Interrupt> {
        let journal = self.engine.journal();
        let actuator = self.engine.actuator();

        let flow = match step {
            Step::Label(_) | Step::Comment => Flow::Next,

            Step::Goto(target) => self.jump(script, target),

            Step::Loop {
                label,
                max_count,
                on_exceed,
            } => {
                let count = {
                    let counter = ctx.loop_counters.entry(label.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                if count <= *max_count {
                    journal.info(format!("Loop {label} ({count}/{max_count})"));
                    self.jump(script, label)
                } else {
                    ctx.loop_counters.insert(label.clone(), 0);
                    match on_exceed {
                        ExceedAction::Stop => {
                            journal.error(format!(
                                "Loop {label} exceeded {max_count} iterations, stopping script"
                            ));
                            Flow::Halt
                        }
                        ExceedAction::Goto(recovery) => {
                            journal.warn(format!(
                                "Loop {label} exceeded {max_count} iterations, jumping to {recovery}"
                            ));
                            self.jump(script, recovery)
                        }
                    }
                }
            }

            Step::Click(target) => {
                journal.draw_target(*target);
                if let Err(e) = actuator.click_at(*target).await {
                    journal.error(format!("Click failed: {e}"));
                }
                Flow::Next
            }

            Step::Key(code) => {
                if let Err(e) = actuator.press(*code).await {
                    journal.error(format!("Key {} failed: {e}", code.0));
                }
                Flow::Next
            }

            Step::Drag { from, to } => {
                journal.info(format!("Drag {from} -> {to}"));
                if let Err(e) = actuator.drag(*from, *to).await {
                    journal.error(format!("Drag failed: {e}"));
                }
                Flow::Next
            }

            Step::Wait(base) => {
                let wait = actuator.fatigue().humanized_wait(*base);
                journal.info(format!("Waiting {base}s (humanized {wait:.2}s)"));
                self.engine.waiter().sleep_secs(wait).await?;
                Flow::Next
            }

            Step::FindImg { template, region } => {
                journal.info(format!("Looking for {}{}", template.display(), region_note(*region)));
                self.show_region(*region);
                let perception = self.engine.perception();
                match perception
                    .find_image(template, DEFAULT_IMAGE_CONFIDENCE, *region)
                    .await
                {
                    Ok(Some(hit)) => {
                        journal.success(format!("Found {} at {hit}", template.display()));
                        self.click_hit(hit).await?;
                    }
                    Ok(None) => journal.warn(format!("{} not found", template.display())),
                    Err(e) => journal.warn(e.to_string()),
                }
                Flow::Next
            }

            Step::Ocr { text, region } => {
                journal.info(format!("OCR for '{text}'{}", region_note(*region)));
                self.show_region(*region);
                match self.engine.perception().ocr(*region).await {
                    Ok(hits) => {
                        let seen: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
                        journal.info(format!("OCR read: {seen:?}"));
                        match self.locate_text(text, &hits, DEFAULT_OCR_SIMILARITY, *region) {
                            Some(hit) => {
                                journal.success(format!("Found '{text}', clicking {hit}"));
                                self.click_hit(hit).await?;
                            }
                            None => journal.warn(format!("'{text}' not found")),
                        }
                    }
                    Err(e) => journal.error(format!("OCR failed: {e}")),
                }
                Flow::Next
            }

            Step::FindColor { color, region } => {
                journal.info(format!("Looking for color {color}{}", region_note(*region)));
                self.show_region(*region);
                match self
                    .engine
                    .perception()
                    .find_color(*color, DEFAULT_COLOR_TOLERANCE, *region)
                    .await
                {
                    Ok(Some(hit)) => {
                        journal.success(format!("Found color {color} at {hit}"));
                        self.click_hit(hit).await?;
                    }
                    Ok(None) => journal.warn(format!("Color {color} not found")),
                    Err(e) => journal.error(format!("Color search failed: {e}")),
                }
                Flow::Next
            }

            Step::IfImage {
                template,
                region,
                label,
            } => {
                journal.info(format!("Checking {}", template.display()));
                self.show_region(*region);
                match self
                    .engine
                    .perception()
                    .find_image(template, DEFAULT_IMAGE_CONFIDENCE, *region)
                    .await
                {
                    Ok(Some(_)) => {
                        journal.success(format!("Condition met, jumping to {label}"));
                        self.jump(script, label)
                    }
                    Ok(None) => {
                        journal.info("Condition not met");
                        Flow::Next
                    }
                    Err(e) => {
                        journal.warn(e.to_string());
                        Flow::Next
                    }
                }
            }

            Step::SmartAction(smart) => self.smart_action(script, smart, ctx, depth).await?,

            Step::LogicPlugin { plugin, label } => match self.plugins.predicate(plugin) {
                Ok(predicate) => match predicate.check(&self.engine).await {
                    Ok(true) => {
                        journal.success(format!("{plugin} returned true, jumping to {label}"));
                        self.jump(script, label)
                    }
                    Ok(false) => Flow::Next,
                    Err(PluginError::Interrupted(interrupt)) => return Err(interrupt),
                    Err(e) => {
                        journal.error(format!("Plugin {plugin} failed: {e}"));
                        Flow::Next
                    }
                },
                Err(e) => {
                    journal.error(format!("Cannot load plugin: {e}"));
                    Flow::Next
                }
            },

            Step::Plugin(name) => match self.plugins.action(name) {
                Ok(action) => match action.run(&self.engine).await {
                    Ok(()) => Flow::Next,
                    Err(PluginError::Interrupted(interrupt)) => return Err(interrupt),
                    Err(e) => {
                        journal.error(format!("Plugin {name} failed: {e}"));
                        Flow::Next
                    }
                },
                Err(e) => {
                    journal.error(format!("Cannot load plugin: {e}"));
                    Flow::Next
                }
            },
        };
        Ok(flow)
    }

    async fn smart_action(
        &self,
        script: &Script,
        smart: &SmartAction,
        ctx: &mut RunContext<'_>,
        depth: usize,
    ) -> Result<Flow, Interrupt> {
        let journal = self.engine.journal();
        journal.info(format!(
            "Smart check: {} (threshold {})",
            describe(&smart.condition),
            smart.threshold
        ));
        self.show_region(smart.region);

        let hit = self.locate(&smart.condition, smart.threshold, smart.region).await;
        let branch = match hit {
            Some(_) => {
                journal.success(format!("Condition met, running {:?}", smart.on_success));
                &smart.on_success
            }
            None => {
                journal.warn(format!("Condition not met, running {:?}", smart.on_failure));
                &smart.on_failure
            }
        };

        let flow = match branch {
            Branch::Continue => Flow::Next,
            Branch::ClickTarget | Branch::ClickOffset { .. } => {
                match (hit, branch) {
                    (Some(p), Branch::ClickOffset { dx, dy }) => {
                        self.click_hit(p.offset(*dx, *dy)).await?
                    }
                    (Some(p), _) => self.click_hit(p).await?,
                    (None, _) => journal.warn("Nothing to click"),
                }
                Flow::Next
            }
            Branch::RunScript(path) => match Script::load(path).await {
                Ok(sub) => {
                    journal.info(format!("Running sub-script {}", sub.name()));
                    match self.execute(&sub, ctx, depth + 1).await? {
                        RunOutcome::Halted => Flow::Halt,
                        RunOutcome::Completed | RunOutcome::Failed => Flow::Next,
                    }
                }
                Err(e) => {
                    journal.error(e.to_string());
                    Flow::Next
                }
            },
            Branch::Goto(label) => self.jump(script, label),
            Branch::Stop => {
                journal.warn(format!("{} stopped by smart action", script.name()));
                Flow::Halt
            }
        };
        Ok(flow)
    }

    /// 识别条件，返回命中位置
    async fn locate(&self, condition: &Condition, threshold: f64, region: Option<Region>) -> Option<Point> {
        let perception = self.engine.perception();
        let journal = self.engine.journal();
        let result = match condition {
            Condition::Image(template) => perception.find_image(template, threshold, region).await,
            Condition::Text(text) => perception.ocr(region).await.map(|hits| {
                let seen: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
                journal.info(format!("OCR read: {seen:?}"));
                self.locate_text(text, &hits, threshold, region)
            }),
            Condition::Color(color) => {
                let tolerance = threshold.round().clamp(0.0, 255.0) as u8;
                perception.find_color(*color, tolerance, region).await
            }
        };
        result.unwrap_or_else(|e| {
            journal.warn(e.to_string());
            None
        })
    }

    /// OCR 命中点：文字框左边缘、垂直居中，换算成屏幕坐标
    fn locate_text(
        &self,
        target: &str,
        hits: &[OcrHit],
        threshold: f64,
        region: Option<Region>,
    ) -> Option<Point> {
        let hit = hits
            .iter()
            .find(|h| is_text_match(target, &h.text, threshold))?;
        let base = region.map_or_else(|| self.engine.perception().origin(), |r| r.origin());
        let anchor = hit.bbox.anchor();
        Some(Point::new(base.x + anchor.x, base.y + anchor.y))
    }

    fn jump(&self, script: &Script, label: &str) -> Flow {
        match script.find_label(label) {
            Some(index) => {
                self.engine.journal().info(format!("Jump to {label}"));
                Flow::Jump(index)
            }
            None => {
                self.engine
                    .journal()
                    .error(format!("Label not found: {label}"));
                Flow::Next
            }
        }
    }

    /// 移过去、稍停、点击；执行器失败只记录
    async fn click_hit(&self, target: Point) -> Result<(), Interrupt> {
        let journal = self.engine.journal();
        let actuator = self.engine.actuator();
        journal.draw_target(target);
        if let Err(e) = actuator.move_to(target).await {
            journal.error(format!("Move failed: {e}"));
            return Ok(());
        }
        self.engine.waiter().sleep(SETTLE_BEFORE_CLICK).await?;
        if let Err(e) = actuator.click().await {
            journal.error(format!("Click failed: {e}"));
        }
        Ok(())
    }

    fn show_region(&self, region: Option<Region>) {
        if let Some(r) = region {
            self.engine.journal().draw_region(r);
        }
    }

    async fn pace(&self, pacing: Pacing) -> Result<(), Interrupt> {
        let base = base_gap(pacing);
        let gap = self.engine.actuator().fatigue().humanized_wait(base);
        self.engine.waiter().sleep_secs(gap).await
    }
}

/// 步骤后间隔的基准秒数
fn base_gap(pacing: Pacing) -> f64 {
    match pacing {
        Pacing::Perception => rand::thread_rng().gen_range(0.5..=0.8),
        Pacing::Input => rand::thread_rng().gen_range(0.1..=0.3),
        Pacing::ControlFlow => 0.01,
        Pacing::Default => 0.1,
    }
}

fn region_note(region: Option<Region>) -> String {
    region.map(|r| format!(" in {r}")).unwrap_or_default()
}

fn describe(condition: &Condition) -> String {
    match condition {
        Condition::Image(path) => format!("image {}", path.display()),
        Condition::Text(text) => format!("text '{text}'"),
        Condition::Color(color) => format!("color {color}"),
    }
}
