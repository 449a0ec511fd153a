//! 视觉能力接口
//!
//! 识别算法本身（模板匹配、OCR、找色）由宿主提供，引擎只通过 [`Perception`] 消费结果。

pub mod text_match;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::PerceptionError;
use crate::geometry::{Point, Region, Rgb};

pub use text_match::is_text_match;

/// 默认找图置信度
pub const DEFAULT_IMAGE_CONFIDENCE: f64 = 0.8;
/// 默认找色容差
pub const DEFAULT_COLOR_TOLERANCE: u8 = 20;
/// 默认 OCR 文本相似度
pub const DEFAULT_OCR_SIMILARITY: f64 = 0.5;

/// OCR 结果的外接矩形（相对于截图区域）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingBox {
    /// 点击锚点：左边缘、垂直居中
    pub fn anchor(&self) -> Point {
        Point::new(self.left, (self.top + self.bottom) / 2)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrHit {
    pub bbox: BoundingBox,
    pub text: String,
    pub confidence: f64,
}

/// 灰度采样帧（看门狗用）
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// 与另一帧的均方误差；尺寸不同时无法比较
    pub fn mse(&self, other: &Frame) -> Option<f64> {
        if self.width != other.width
            || self.height != other.height
            || self.pixels.len() != other.pixels.len()
            || self.pixels.is_empty()
        {
            return None;
        }
        let sum: f64 = self
            .pixels
            .iter()
            .zip(&other.pixels)
            .map(|(a, b)| {
                let d = f64::from(*a) - f64::from(*b);
                d * d
            })
            .sum();
        Some(sum / self.pixels.len() as f64)
    }
}

#[async_trait]
pub trait Perception: Send + Sync {
    /// 模板匹配，返回匹配中心的屏幕坐标
    async fn find_image(
        &self,
        template: &Path,
        confidence: f64,
        region: Option<Region>,
    ) -> Result<Option<Point>, PerceptionError>;

    async fn ocr(&self, region: Option<Region>) -> Result<Vec<OcrHit>, PerceptionError>;

    async fn find_color(
        &self,
        color: Rgb,
        tolerance: u8,
        region: Option<Region>,
    ) -> Result<Option<Point>, PerceptionError>;

    /// 单个像素的颜色
    async fn pixel(&self, at: Point) -> Result<Rgb, PerceptionError>;

    async fn capture_sample(&self) -> Result<Frame, PerceptionError>;

    /// 被监视屏幕的左上角；全屏 OCR 的锚点以此为基准
    fn origin(&self) -> Point {
        Point::default()
    }
}

/// 可预设结果的视觉实现：没有识别后端时使用（模拟宿主与测试）
///
/// 未登记的模板视为无法读取；其余查询默认"未命中"。
#[derive(Debug, Default)]
pub struct ScriptedPerception {
    state: Mutex<ScriptedState>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    images: HashMap<PathBuf, Option<Point>>,
    ocr: Vec<OcrHit>,
    color: Option<Point>,
    pixels: HashMap<Point, Rgb>,
    frames: Vec<Frame>,
    origin: Point,
    queries: usize,
}

impl ScriptedPerception {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptedState) -> T) -> Result<T, PerceptionError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PerceptionError::Recognition("scripted perception poisoned".into()))?;
        Ok(f(&mut state))
    }

    /// 登记模板；`hit` 为 None 表示模板存在但画面中找不到
    pub fn set_image(&self, template: impl Into<PathBuf>, hit: Option<Point>) {
        let template = template.into();
        let _ = self.with_state(|s| s.images.insert(template, hit));
    }

    pub fn set_ocr(&self, hits: Vec<OcrHit>) {
        let _ = self.with_state(|s| s.ocr = hits);
    }

    pub fn set_color(&self, hit: Option<Point>) {
        let _ = self.with_state(|s| s.color = hit);
    }

    pub fn set_pixel(&self, at: Point, color: Rgb) {
        let _ = self.with_state(|s| s.pixels.insert(at, color));
    }

    /// 依次返回的采样帧；用完后重复最后一帧
    pub fn push_frame(&self, frame: Frame) {
        let _ = self.with_state(|s| s.frames.push(frame));
    }

    pub fn set_origin(&self, origin: Point) {
        let _ = self.with_state(|s| s.origin = origin);
    }

    /// 已处理的识别请求数
    pub fn queries(&self) -> usize {
        self.with_state(|s| s.queries).unwrap_or_default()
    }
}

#[async_trait]
impl Perception for ScriptedPerception {
    async fn find_image(
        &self,
        template: &Path,
        _confidence: f64,
        _region: Option<Region>,
    ) -> Result<Option<Point>, PerceptionError> {
        let hit = self.with_state(|s| {
            s.queries += 1;
            s.images.get(template).copied()
        })?;
        hit.ok_or_else(|| PerceptionError::Template(template.to_path_buf()))
    }

    async fn ocr(&self, _region: Option<Region>) -> Result<Vec<OcrHit>, PerceptionError> {
        self.with_state(|s| {
            s.queries += 1;
            s.ocr.clone()
        })
    }

    async fn find_color(
        &self,
        _color: Rgb,
        _tolerance: u8,
        _region: Option<Region>,
    ) -> Result<Option<Point>, PerceptionError> {
        self.with_state(|s| {
            s.queries += 1;
            s.color
        })
    }

    async fn pixel(&self, at: Point) -> Result<Rgb, PerceptionError> {
        self.with_state(|s| s.pixels.get(&at).copied())?
            .ok_or_else(|| PerceptionError::Capture(format!("no pixel sample at {at}")))
    }

    async fn capture_sample(&self) -> Result<Frame, PerceptionError> {
        self.with_state(|s| {
            if s.frames.len() > 1 {
                Some(s.frames.remove(0))
            } else {
                s.frames.first().cloned()
            }
        })?
        .ok_or_else(|| PerceptionError::Capture("no frame available".into()))
    }

    fn origin(&self) -> Point {
        self.with_state(|s| s.origin).unwrap_or_default()
    }
}
