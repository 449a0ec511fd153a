//! 疲劳模型：所有拟人化时序噪声的来源
//!
//! 疲劳度是会话已运行时间的线性函数（默认 4 小时达到 1.0），
//! 反应倍率在疲劳基础上叠加每次重新采样的抖动，因此同一时刻的两次调用结果也可能不同。

use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tokio::time::Instant;

/// 默认疲劳顶峰：连续运行 4 小时
pub const DEFAULT_CUTOFF: Duration = Duration::from_secs(14_400);

/// 会话疲劳状态；只存会话起点，疲劳度按需推导
#[derive(Debug, Clone)]
pub struct FatigueModel {
    session_start: Instant,
    /// 恢复会话时已经累计的时长
    carried: Duration,
    cutoff: Duration,
}

/// 一次发呆（垃圾时间）的时长
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleBreak {
    pub duration: Duration,
}

impl FatigueModel {
    pub fn new(cutoff: Duration) -> Self {
        Self {
            session_start: Instant::now(),
            carried: Duration::ZERO,
            cutoff: if cutoff.is_zero() { DEFAULT_CUTOFF } else { cutoff },
        }
    }

    /// 以已累计 `elapsed` 的状态开始（测试与会话恢复）
    pub fn resumed(cutoff: Duration, elapsed: Duration) -> Self {
        Self {
            carried: elapsed,
            ..Self::new(cutoff)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.carried + self.session_start.elapsed()
    }

    /// 疲劳度 ∈ [0, 1]
    pub fn fatigue_level(&self) -> f64 {
        (self.elapsed().as_secs_f64() / self.cutoff.as_secs_f64()).min(1.0)
    }

    /// 反应时间倍率：1.0 + 疲劳*0.8 + U(-0.1, 0.1)，下限 0.9
    pub fn reaction_multiplier(&self) -> f64 {
        self.reaction_multiplier_with(&mut rand::thread_rng())
    }

    pub fn reaction_multiplier_with<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let noise = rng.gen_range(-0.1..=0.1);
        (1.0 + self.fatigue_level() * 0.8 + noise).max(0.9)
    }

    /// 把固定等待时间换算为拟人化时间（秒）：高斯采样，至少保留原时间的一半
    pub fn humanized_wait(&self, base_secs: f64) -> f64 {
        self.humanized_wait_with(base_secs, &mut rand::thread_rng())
    }

    pub fn humanized_wait_with<R: Rng + ?Sized>(&self, base_secs: f64, rng: &mut R) -> f64 {
        if !base_secs.is_finite() || base_secs <= 0.0 {
            return 0.0;
        }
        let mean = base_secs * self.reaction_multiplier_with(rng);
        let sigma = base_secs * rng.gen_range(0.15..=0.25);
        let sample = Normal::new(mean, sigma)
            .map(|n| n.sample(rng))
            .unwrap_or(mean);
        sample.max(base_secs * 0.5)
    }

    /// `humanized_wait` 的 Duration 版本；换算溢出时退回原时长
    pub fn humanized(&self, base: Duration) -> Duration {
        Duration::try_from_secs_f64(self.humanized_wait(base.as_secs_f64())).unwrap_or(base)
    }

    /// 是否该发呆：概率 1% ~ 6%，成功时给出 2~10 秒的时长；由调用方负责真正等待
    pub fn should_take_idle_break(&self) -> Option<IdleBreak> {
        self.should_take_idle_break_with(&mut rand::thread_rng())
    }

    pub fn should_take_idle_break_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<IdleBreak> {
        let chance = 0.01 + self.fatigue_level() * 0.05;
        if rng.gen_bool(chance.clamp(0.0, 1.0)) {
            let secs = rng.gen_range(2.0..=10.0);
            tracing::info!(secs = format!("{secs:.1}"), "Fatigue idle break");
            Some(IdleBreak {
                duration: Duration::from_secs_f64(secs),
            })
        } else {
            None
        }
    }
}

impl Default for FatigueModel {
    fn default() -> Self {
        Self::new(DEFAULT_CUTOFF)
    }
}
