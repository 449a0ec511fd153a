//! 内置插件
//!
//! - `human_idle`：发呆 2~4 秒，期间随机微颤
//! - `random_noise`：30% 概率做一个无意义的小动作
//! - `bio_clock`：按时段模拟吃饭、上厕所、深夜变慢
//! - `pixel_mismatch`：指定像素不是预期颜色时成立（例如血条掉了）
//! - `minimap_walker`：盯着小地图上的目标图标一路走过去
//! - `demo_afk`：绕屏幕中心画一圈，防止被判定挂机

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Timelike};
use rand::seq::SliceRandom;
use rand::Rng;

use super::{
    ActionPlugin, EngineHandle, PluginError, PluginKind, PluginMetadata, PluginParams,
    PredicatePlugin,
};
use crate::actuator::KeyCode;
use crate::geometry::{Point, Region, Rgb};

/// 内置插件 id
pub const CATALOG: [&str; 6] = [
    "human_idle",
    "random_noise",
    "bio_clock",
    "pixel_mismatch",
    "minimap_walker",
    "demo_afk",
];

/// 实例化后的插件
pub enum Registered {
    Action(Arc<dyn ActionPlugin>),
    Predicate(Arc<dyn PredicatePlugin>),
}

impl Registered {
    pub fn kind(&self) -> PluginKind {
        match self {
            Registered::Action(_) => PluginKind::Action,
            Registered::Predicate(_) => PluginKind::Predicate,
        }
    }
}

/// 按内置名称创建插件；`id` 为 None 时沿用内置名称
pub fn instantiate(
    builtin: &str,
    id: Option<&str>,
    params: &PluginParams,
) -> Result<Registered, PluginError> {
    let rename = |meta: PluginMetadata| match id {
        Some(id) => meta.with_id(id),
        None => meta,
    };
    let plugin = match builtin {
        "human_idle" => Registered::Action(Arc::new(HumanIdle::new(params, rename))),
        "random_noise" => Registered::Action(Arc::new(RandomNoise::new(params, rename)?)),
        "bio_clock" => Registered::Action(Arc::new(BioClock::new(rename))),
        "pixel_mismatch" => Registered::Predicate(Arc::new(PixelMismatch::new(params, rename)?)),
        "minimap_walker" => Registered::Action(Arc::new(MinimapWalker::new(params, rename)?)),
        "demo_afk" => Registered::Action(Arc::new(CircleIdle::new(params, rename)?)),
        other => return Err(PluginError::UnknownBuiltin(other.to_string())),
    };
    Ok(plugin)
}

fn uniform(range: RangeInclusive<f64>) -> Duration {
    Duration::from_secs_f64(rand::thread_rng().gen_range(range))
}

fn parse_point(params: &PluginParams, key: &str, default: Point) -> Result<Point, PluginError> {
    match params.get::<String>(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| PluginError::ConfigError(format!("{key}: {e}"))),
        None => Ok(default),
    }
}

/// 拟人化发呆：一段时间内以 30% 概率微颤光标
pub struct HumanIdle {
    metadata: PluginMetadata,
    min_secs: f64,
    max_secs: f64,
    move_chance: f64,
    reach: i32,
}

impl HumanIdle {
    fn new(params: &PluginParams, rename: impl Fn(PluginMetadata) -> PluginMetadata) -> Self {
        let min_secs: f64 = params.get_or("min_secs", 2.0);
        let max_secs: f64 = params.get_or("max_secs", 4.0);
        Self {
            metadata: rename(
                PluginMetadata::new("human_idle", "Human idle", PluginKind::Action)
                    .with_description("Zone out for a few seconds with a slight hand tremor"),
            ),
            min_secs: min_secs.max(0.0),
            max_secs: max_secs.max(min_secs.max(0.0)),
            move_chance: params.get_or("move_chance", 0.3_f64).clamp(0.0, 1.0),
            reach: params.get_or("reach", 3),
        }
    }
}

#[async_trait]
impl ActionPlugin for HumanIdle {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn run(&self, engine: &EngineHandle) -> Result<(), PluginError> {
        let total = uniform(self.min_secs..=self.max_secs);
        engine.log(format!("Idling for {:.1}s", total.as_secs_f64()));

        let started = tokio::time::Instant::now();
        while started.elapsed() < total {
            let wander = rand::thread_rng().gen_bool(self.move_chance);
            if wander {
                engine.actuator().nudge(self.reach).await?;
            }
            engine.pause(uniform(0.1..=0.5)).await?;
            if engine.should_stop() {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Noise {
    ToggleInventory,
    Wander,
    ClickBlank,
    Nothing,
}

/// 随机废操作
pub struct RandomNoise {
    metadata: PluginMetadata,
    chance: f64,
    inventory_key: KeyCode,
    blank_point: Point,
}

impl RandomNoise {
    fn new(
        params: &PluginParams,
        rename: impl Fn(PluginMetadata) -> PluginMetadata,
    ) -> Result<Self, PluginError> {
        Ok(Self {
            metadata: rename(
                PluginMetadata::new("random_noise", "Random noise", PluginKind::Action)
                    .with_description("Occasionally do something pointless"),
            ),
            chance: params.get_or("chance", 0.3_f64).clamp(0.0, 1.0),
            inventory_key: KeyCode(params.get_or("inventory_key", 73)),
            blank_point: parse_point(params, "blank_point", Point::new(100, 300))?,
        })
    }
}

#[async_trait]
impl ActionPlugin for RandomNoise {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn run(&self, engine: &EngineHandle) -> Result<(), PluginError> {
        let choice = {
            let mut rng = rand::thread_rng();
            if !rng.gen_bool(self.chance) {
                None
            } else {
                [Noise::ToggleInventory, Noise::Wander, Noise::ClickBlank, Noise::Nothing]
                    .choose(&mut rng)
                    .copied()
            }
        };
        let Some(choice) = choice else {
            engine.log("Skipping random noise this time");
            return Ok(());
        };
        engine.log(format!("Random noise: {choice:?}"));

        let actuator = engine.actuator();
        match choice {
            Noise::ToggleInventory => {
                actuator.press(self.inventory_key).await?;
                engine.pause(uniform(0.5..=1.5)).await?;
                actuator.press(self.inventory_key).await?;
            }
            Noise::Wander => {
                let center = actuator.position();
                for _ in 0..5 {
                    let (dx, dy) = {
                        let mut rng = rand::thread_rng();
                        (rng.gen_range(-100..=100), rng.gen_range(-100..=100))
                    };
                    actuator.move_to(center.offset(dx, dy)).await?;
                    engine.pause(Duration::from_millis(100)).await?;
                }
            }
            Noise::ClickBlank => {
                actuator.click_at(self.blank_point).await?;
            }
            Noise::Nothing => {}
        }
        Ok(())
    }
}

/// 生理时钟给出的休息
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BioBreak {
    /// 吃饭：15~40 分钟
    Meal(Duration),
    /// 上厕所 / 倒水：1~3 分钟
    Short(Duration),
    /// 深夜精神不济：2~5 秒
    Drowsy(Duration),
}

impl BioBreak {
    pub fn duration(&self) -> Duration {
        match *self {
            BioBreak::Meal(d) | BioBreak::Short(d) | BioBreak::Drowsy(d) => d,
        }
    }
}

/// 根据当前小时决定是否休息
pub fn plan_bio_break<R: Rng + ?Sized>(hour: u32, rng: &mut R) -> Option<BioBreak> {
    let mealtime = (11..=13).contains(&hour) || (17..=19).contains(&hour);
    let late_night = (2..=6).contains(&hour);

    if mealtime && rng.gen_bool(0.01) {
        return Some(BioBreak::Meal(Duration::from_secs_f64(
            rng.gen_range(15.0 * 60.0..=40.0 * 60.0),
        )));
    }
    if rng.gen_bool(0.005) {
        return Some(BioBreak::Short(Duration::from_secs_f64(rng.gen_range(60.0..=180.0))));
    }
    if late_night {
        return Some(BioBreak::Drowsy(Duration::from_secs_f64(rng.gen_range(2.0..=5.0))));
    }
    None
}

pub struct BioClock {
    metadata: PluginMetadata,
}

impl BioClock {
    fn new(rename: impl Fn(PluginMetadata) -> PluginMetadata) -> Self {
        Self {
            metadata: rename(
                PluginMetadata::new("bio_clock", "Bio clock", PluginKind::Action)
                    .with_description("Meal breaks, bathroom breaks and late-night slowdown"),
            ),
        }
    }
}

#[async_trait]
impl ActionPlugin for BioClock {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn run(&self, engine: &EngineHandle) -> Result<(), PluginError> {
        let plan = plan_bio_break(Local::now().hour(), &mut rand::thread_rng());
        let Some(rest) = plan else {
            return Ok(());
        };
        let minutes = rest.duration().as_secs_f64() / 60.0;
        match rest {
            BioBreak::Meal(_) => {
                engine.log(format!("Meal time, resting {minutes:.1} min"));
                // 动一下鼠标，避免长时间静止被踢
                engine.actuator().nudge(5).await?;
            }
            BioBreak::Short(_) => engine.log(format!("Short break, away {:.0}s", minutes * 60.0)),
            BioBreak::Drowsy(_) => engine.log("Late night, slowing down"),
        }
        engine.pause(rest.duration()).await?;
        if matches!(rest, BioBreak::Meal(_)) {
            engine.log("Back from the meal break");
        }
        Ok(())
    }
}

/// 像素颜色不符时成立
pub struct PixelMismatch {
    metadata: PluginMetadata,
    at: Point,
    expected: Rgb,
    tolerance: u8,
}

impl PixelMismatch {
    fn new(
        params: &PluginParams,
        rename: impl Fn(PluginMetadata) -> PluginMetadata,
    ) -> Result<Self, PluginError> {
        let expected = match params.get::<String>("rgb") {
            Some(raw) => raw
                .parse()
                .map_err(|e| PluginError::ConfigError(format!("rgb: {e}")))?,
            None => Rgb(255, 0, 0),
        };
        Ok(Self {
            metadata: rename(
                PluginMetadata::new("pixel_mismatch", "Pixel mismatch", PluginKind::Predicate)
                    .with_description("True when the pixel no longer shows the expected color"),
            ),
            at: Point::new(params.get_or("x", 100), params.get_or("y", 30)),
            expected,
            tolerance: params.get_or("tolerance", 30),
        })
    }
}

#[async_trait]
impl PredicatePlugin for PixelMismatch {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn check(&self, engine: &EngineHandle) -> Result<bool, PluginError> {
        let actual = engine.perception().pixel(self.at).await?;
        let mismatch = !actual.within(self.expected, self.tolerance);
        if mismatch {
            engine.log(format!(
                "Pixel {} is {} (expected {}), condition met",
                self.at, actual, self.expected
            ));
        }
        Ok(mismatch)
    }
}

/// 小地图导航的移动方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// 朝目标方向在屏幕中心外 200px 处点击
    Mouse,
    /// 按住 W/A/S/D
    Keyboard,
}

const WALK_KEYS: [(KeyCode, KeyCode); 2] = [
    // (负方向, 正方向)：x 轴 A/D，y 轴 W/S
    (KeyCode(65), KeyCode(68)),
    (KeyCode(87), KeyCode(83)),
];
const WALK_DEADZONE: i32 = 10;
const WALK_CLICK_REACH: f64 = 200.0;
const WALK_CONFIDENCE: f64 = 0.7;

/// 小地图长途导航：反复在小地图区域找目标图标，向它移动，直到图标离小地图中心足够近
pub struct MinimapWalker {
    metadata: PluginMetadata,
    region: Option<Region>,
    icon: Option<std::path::PathBuf>,
    mode: WalkMode,
    arrival_px: f64,
    max_attempts: u32,
}

impl MinimapWalker {
    fn new(
        params: &PluginParams,
        rename: impl Fn(PluginMetadata) -> PluginMetadata,
    ) -> Result<Self, PluginError> {
        let region = match params.get::<String>("region") {
            Some(raw) => Some(Region::parse_suffix(&raw).ok_or_else(|| {
                PluginError::ConfigError(format!("region: expected x,y,w,h, got '{raw}'"))
            })?),
            None => None,
        };
        let mode = match params.get_or("mode", "mouse".to_string()).as_str() {
            "mouse" => WalkMode::Mouse,
            "keyboard" => WalkMode::Keyboard,
            other => return Err(PluginError::ConfigError(format!("mode: unknown '{other}'"))),
        };
        Ok(Self {
            metadata: rename(
                PluginMetadata::new("minimap_walker", "Minimap walker", PluginKind::Action)
                    .with_description("Walk toward an icon tracked on the minimap"),
            ),
            region,
            icon: params.get::<String>("icon").map(std::path::PathBuf::from),
            mode,
            arrival_px: params.get_or("arrival_dist", 15.0_f64).clamp(5.0, 100.0),
            max_attempts: params.get_or("max_attempts", 100_u32),
        })
    }

    async fn step_keyboard(&self, engine: &EngineHandle, dx: i32, dy: i32) -> Result<(), PluginError> {
        let held: Vec<KeyCode> = WALK_KEYS
            .iter()
            .zip([dx, dy])
            .filter_map(|(&(negative, positive), delta)| match delta {
                d if d < -WALK_DEADZONE => Some(negative),
                d if d > WALK_DEADZONE => Some(positive),
                _ => None,
            })
            .collect();

        let actuator = engine.actuator();
        for key in &held {
            actuator.key_down(*key).await?;
        }
        let paused = engine.pause(uniform(0.3..=0.6)).await;
        for key in &held {
            actuator.key_up(*key).await?;
        }
        paused
    }

    async fn step_mouse(&self, engine: &EngineHandle, dx: i32, dy: i32) -> Result<(), PluginError> {
        let actuator = engine.actuator();
        let screen = actuator.screen();
        let angle = f64::from(dy).atan2(f64::from(dx));
        let target = Point::new(
            screen.width / 2 + (angle.cos() * WALK_CLICK_REACH) as i32,
            screen.height / 2 + (angle.sin() * WALK_CLICK_REACH) as i32,
        );
        actuator.move_to(target).await?;
        engine.pause(Duration::from_millis(100)).await?;
        actuator.click().await?;
        engine
            .pause(actuator.fatigue().humanized(Duration::from_secs(1)))
            .await
    }
}

#[async_trait]
impl ActionPlugin for MinimapWalker {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn run(&self, engine: &EngineHandle) -> Result<(), PluginError> {
        let (Some(region), Some(icon)) = (self.region, self.icon.as_deref()) else {
            engine.log("Minimap walker needs both region and icon configured");
            return Ok(());
        };
        let center = Point::new(region.x + region.w / 2, region.y + region.h / 2);
        engine.log(format!("Navigating toward {}", icon.display()));

        for _ in 0..self.max_attempts {
            let found = match engine
                .perception()
                .find_image(icon, WALK_CONFIDENCE, Some(region))
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    engine.log(format!("Minimap lookup failed: {e}"));
                    break;
                }
            };
            let Some(pos) = found else {
                engine.log("Lost the target on the minimap");
                break;
            };

            let (dx, dy) = (pos.x - center.x, pos.y - center.y);
            if f64::from(dx).hypot(f64::from(dy)) < self.arrival_px {
                engine.log("Arrived at destination");
                engine.actuator().release_all().await?;
                return Ok(());
            }

            match self.mode {
                WalkMode::Keyboard => self.step_keyboard(engine, dx, dy).await?,
                WalkMode::Mouse => self.step_mouse(engine, dx, dy).await?,
            }
            if engine.should_stop() {
                break;
            }
        }
        engine.actuator().release_all().await?;
        Ok(())
    }
}

/// 画圈防挂机：以 `center` 为圆心、`radius` 为半径，每 `step_degrees` 度移动一次
pub struct CircleIdle {
    metadata: PluginMetadata,
    center: Option<Point>,
    radius: f64,
    step_degrees: usize,
}

impl CircleIdle {
    fn new(
        params: &PluginParams,
        rename: impl Fn(PluginMetadata) -> PluginMetadata,
    ) -> Result<Self, PluginError> {
        let center = match params.get::<String>("center") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|e| PluginError::ConfigError(format!("center: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            metadata: rename(
                PluginMetadata::new("demo_afk", "Circle idle", PluginKind::Action)
                    .with_description("Trace a circle so the session never looks idle"),
            ),
            center,
            radius: params.get_or("radius", 100.0_f64).abs(),
            step_degrees: params.get_or("step_degrees", 20_usize).clamp(1, 180),
        })
    }

    /// 圆周上的途经点，从 0° 开始
    pub fn waypoints(&self, center: Point) -> Vec<Point> {
        (0..360)
            .step_by(self.step_degrees)
            .map(|deg| {
                let angle = (deg as f64).to_radians();
                Point::new(
                    center.x + (self.radius * angle.cos()) as i32,
                    center.y + (self.radius * angle.sin()) as i32,
                )
            })
            .collect()
    }
}

#[async_trait]
impl ActionPlugin for CircleIdle {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn run(&self, engine: &EngineHandle) -> Result<(), PluginError> {
        let actuator = engine.actuator();
        let screen = actuator.screen();
        let center = self
            .center
            .unwrap_or_else(|| Point::new(screen.width / 2, screen.height / 2));
        engine.log("Tracing an idle circle");
        for point in self.waypoints(center) {
            actuator.move_to(point).await?;
            engine.pause(Duration::from_millis(50)).await?;
        }
        Ok(())
    }
}
