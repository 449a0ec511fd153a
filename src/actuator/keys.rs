//! 按键代码与按压时长分类（Keystroke Dynamics）
//!
//! 代码沿用执行器固件的键盘编码：可打印字符为 ASCII，功能键在 128 以上。

use std::ops::RangeInclusive;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// 执行器键盘编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyCode(pub u16);

impl KeyCode {
    pub const LEFT_CTRL: KeyCode = KeyCode(128);
    pub const LEFT_SHIFT: KeyCode = KeyCode(129);
    pub const LEFT_ALT: KeyCode = KeyCode(130);
    pub const UP: KeyCode = KeyCode(218);
    pub const DOWN: KeyCode = KeyCode(217);
    pub const LEFT: KeyCode = KeyCode(216);
    pub const RIGHT: KeyCode = KeyCode(215);
    pub const RETURN: KeyCode = KeyCode(176);
    pub const ESC: KeyCode = KeyCode(177);
    pub const SPACE: KeyCode = KeyCode(32);
    pub const BACKSPACE: KeyCode = KeyCode(178);
    pub const TAB: KeyCode = KeyCode(179);
    pub const F1: KeyCode = KeyCode(194);
    pub const F12: KeyCode = KeyCode(205);

    /// 鼠标左键（拖曳时按住）
    pub const MOUSE_LEFT: KeyCode = KeyCode(1);

    pub fn category(self) -> KeyCategory {
        match self {
            KeyCode::LEFT_CTRL
            | KeyCode::LEFT_SHIFT
            | KeyCode::LEFT_ALT
            | KeyCode::UP
            | KeyCode::DOWN
            | KeyCode::LEFT
            | KeyCode::RIGHT => KeyCategory::ModifierOrNavigation,
            KeyCode::RETURN | KeyCode::ESC | KeyCode::SPACE | KeyCode::BACKSPACE | KeyCode::TAB => {
                KeyCategory::CommonAction
            }
            KeyCode(48..=57) | KeyCode(194..=205) => KeyCategory::DigitOrFunction,
            _ => KeyCategory::Alphabetic,
        }
    }
}

impl std::str::FromStr for KeyCode {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u16>().map(KeyCode)
    }
}

/// 按键类别：决定按住多久
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCategory {
    /// Shift / Ctrl / Alt / 方向键：按最久
    ModifierOrNavigation,
    /// Enter / Esc / Space / Backspace / Tab
    CommonAction,
    /// 0-9、F1-F12
    DigitOrFunction,
    /// 其余（字母）：轻快敲击
    Alphabetic,
}

impl KeyCategory {
    /// 基础按住时长（秒），尚未乘以反应倍率
    pub fn hold_range(self) -> RangeInclusive<f64> {
        match self {
            KeyCategory::ModifierOrNavigation => 0.15..=0.25,
            KeyCategory::CommonAction => 0.10..=0.18,
            KeyCategory::DigitOrFunction => 0.08..=0.14,
            KeyCategory::Alphabetic => 0.05..=0.11,
        }
    }

    pub fn sample_hold<R: Rng + ?Sized>(self, rng: &mut R) -> f64 {
        rng.gen_range(self.hold_range())
    }
}

/// 抬指延迟：与类别无关，避免两次按键黏在一起
pub const RELEASE_LATENCY: RangeInclusive<f64> = 0.02..=0.05;
