//! 屏幕几何：坐标点、矩形区域、屏幕边界、RGB 颜色
//!
//! 步骤值中的区域统一编码为 `x,y,w,h`，坐标为 `x,y`，颜色为 `r,g,b`。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::StepError;

/// 屏幕绝对坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f64 {
        let dx = f64::from(other.x - self.x);
        let dy = f64::from(other.y - self.y);
        dx.hypot(dy)
    }

    pub fn offset(self, dx: i32, dy: i32) -> Point {
        Point::new(self.x.saturating_add(dx), self.y.saturating_add(dy))
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl FromStr for Point {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let nums = parse_ints(s, 2)?;
        Ok(Point::new(nums[0], nums[1]))
    }
}

/// 矩形搜索区域（左上角 + 宽高）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Region {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// 尝试把 `x,y,w,h` 解析为区域；不是四个整数时返回 None
    pub fn parse_suffix(s: &str) -> Option<Region> {
        let nums = parse_ints(s, 4).ok()?;
        Some(Region::new(nums[0], nums[1], nums[2], nums[3]))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.w, self.h)
    }
}

/// 屏幕分辨率；所有移动目标都被夹在 1px 边距之内
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screen {
    pub width: i32,
    pub height: i32,
}

impl Screen {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn clamp(&self, p: Point) -> Point {
        Point::new(
            p.x.clamp(1, (self.width - 2).max(1)),
            p.y.clamp(1, (self.height - 2).max(1)),
        )
    }

    pub fn contains(&self, p: Point) -> bool {
        (1..=(self.width - 2).max(1)).contains(&p.x) && (1..=(self.height - 2).max(1)).contains(&p.y)
    }
}

impl Default for Screen {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

/// RGB 颜色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// 每个通道差值都在容差之内
    pub fn within(&self, other: Rgb, tolerance: u8) -> bool {
        let near = |a: u8, b: u8| a.abs_diff(b) <= tolerance;
        near(self.0, other.0) && near(self.1, other.1) && near(self.2, other.2)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.0, self.1, self.2)
    }
}

impl FromStr for Rgb {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let nums = parse_ints(s, 3)?;
        let channel = |v: i32| {
            u8::try_from(v).map_err(|_| StepError::Malformed(format!("color channel out of range: {v}")))
        };
        Ok(Rgb(channel(nums[0])?, channel(nums[1])?, channel(nums[2])?))
    }
}

fn parse_ints(s: &str, expected: usize) -> Result<Vec<i32>, StepError> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != expected {
        return Err(StepError::Malformed(format!(
            "expected {expected} comma-separated integers, got '{s}'"
        )));
    }
    parts
        .iter()
        .map(|p| {
            p.parse::<i32>()
                .map_err(|_| StepError::Malformed(format!("not an integer: '{p}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_parse() {
        assert_eq!("10, 20".parse::<Point>().unwrap(), Point::new(10, 20));
        assert!("10".parse::<Point>().is_err());
        assert!("a,b".parse::<Point>().is_err());
    }

    #[test]
    fn test_region_suffix() {
        assert_eq!(Region::parse_suffix("0,0,100,100"), Some(Region::new(0, 0, 100, 100)));
        assert_eq!(Region::parse_suffix("x.png"), None);
        assert_eq!(Region::parse_suffix("1,2,3"), None);
    }

    #[test]
    fn test_screen_clamp_keeps_margin() {
        let screen = Screen::new(800, 600);
        assert_eq!(screen.clamp(Point::new(-50, 9999)), Point::new(1, 598));
        assert!(screen.contains(Point::new(1, 1)));
        assert!(!screen.contains(Point::new(0, 1)));
        assert!(!screen.contains(Point::new(799, 10)));
    }

    #[test]
    fn test_rgb_tolerance() {
        let red: Rgb = "255,0,0".parse().unwrap();
        assert!(red.within(Rgb(240, 10, 5), 20));
        assert!(!red.within(Rgb(200, 0, 0), 20));
        assert!("256,0,0".parse::<Rgb>().is_err());
    }
}
