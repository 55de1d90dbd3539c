//! Learning rate schedule.
//!
//! The defaults (no warmup, no decay) give the constant-LR AdamW of the
//! reference training setup; warmup and cosine / linear decay are opt-in.

use std::f64::consts::PI;
use std::str::FromStr;

use lam_common::ConfigError;

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Shape of the learning rate after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Cosine,
    Linear,
    None,
}

impl FromStr for LrDecay {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "none" | "constant" => Ok(Self::None),
            _ => Err(ConfigError::UnknownOption {
                kind: "lr decay",
                value: s.to_string(),
            }),
        }
    }
}

impl LrDecay {
    /// Share of the `peak - min` range still applied once a fraction `t` of
    /// the decay window has elapsed. Goes from 1 at `t = 0` to 0 at `t = 1`.
    pub fn factor(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Cosine => 0.5 * (1.0 + (PI * t).cos()),
            Self::Linear => 1.0 - t,
            Self::None => 1.0,
        }
    }
}

/// Per-step learning rate: a linear ramp over `warmup_steps`, then `decay`
/// from the peak down to `min_lr` at `total_steps`. Past `total_steps` the
/// rate stays at `min_lr`. `total_steps = 0` keeps the peak after warmup.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    peak_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    decay: LrDecay,
}

impl LrScheduler {
    pub fn new(peak_lr: f64, min_lr: f64, warmup_steps: usize, total_steps: usize, decay: LrDecay) -> Self {
        Self {
            step: 0,
            peak_lr,
            min_lr,
            warmup_steps,
            total_steps,
            decay,
        }
    }

    /// Rate for an arbitrary step.
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        match self.decay_progress(step) {
            Some(t) => self.min_lr + (self.peak_lr - self.min_lr) * self.decay.factor(t),
            None => self.peak_lr,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    /// Elapsed fraction of the decay window, `None` when nothing decays.
    fn decay_progress(&self, step: usize) -> Option<f64> {
        if self.decay == LrDecay::None || self.total_steps <= self.warmup_steps {
            return None;
        }
        let window = (self.total_steps - self.warmup_steps) as f64;
        Some((step - self.warmup_steps) as f64 / window)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Jump to `step`, e.g. when resuming from a checkpoint.
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lr_warmup() {
        let sched = LrScheduler::new(1e-3, 1e-6, 100, 1000, LrDecay::Cosine);
        // Step 0: (0+1)/100 * 1e-3 = 1e-5
        assert!((sched.current_lr() - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn lr_cosine_midpoint() {
        let mut sched = LrScheduler::new(1e-3, 0.0, 0, 1000, LrDecay::Cosine);
        for _ in 0..500 {
            sched.advance();
        }
        // Midpoint of cosine: cos(π·0.5) = 0 → lr = 0.5 * 1e-3
        assert!((sched.current_lr() - 5e-4).abs() < 1e-6);
    }

    #[test]
    fn lr_resume_matches_continuous_run() {
        let mut a = LrScheduler::new(1e-3, 1e-5, 10, 200, LrDecay::Linear);
        for _ in 0..73 {
            a.advance();
        }
        let mut b = LrScheduler::new(1e-3, 1e-5, 10, 200, LrDecay::Linear);
        b.set_step(a.step());
        assert_eq!(a.current_lr(), b.current_lr());
    }

    #[test]
    fn decay_names() {
        assert_eq!("cosine".parse::<LrDecay>().unwrap(), LrDecay::Cosine);
        assert_eq!("none".parse::<LrDecay>().unwrap(), LrDecay::None);
        assert!("step".parse::<LrDecay>().is_err());
    }

    #[test]
    fn lr_no_decay() {
        let mut sched = LrScheduler::new(1e-3, 1e-6, 0, 1000, LrDecay::None);
        for _ in 0..500 {
            sched.advance();
        }
        assert!((sched.current_lr() - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn decay_factor_endpoints() {
        for decay in [LrDecay::Cosine, LrDecay::Linear] {
            assert!((decay.factor(0.0) - 1.0).abs() < 1e-12);
            assert!(decay.factor(1.0).abs() < 1e-12);
            assert!(decay.factor(2.0).abs() < 1e-12, "clamped past the window");
        }
        assert_eq!(LrDecay::None.factor(0.7), 1.0);
    }

    #[test]
    fn warmup_hands_over_to_decay_at_peak() {
        let sched = LrScheduler::new(2e-3, 1e-4, 20, 120, LrDecay::Linear);
        assert!((sched.lr_at(19) - 2e-3).abs() < 1e-12);
        assert!((sched.lr_at(20) - 2e-3).abs() < 1e-12);
        assert!((sched.lr_at(70) - (1e-4 + 1.9e-3 * 0.5)).abs() < 1e-12);
        assert!((sched.lr_at(120) - 1e-4).abs() < 1e-12);
        assert!((sched.lr_at(500) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn window_shorter_than_warmup_keeps_peak() {
        let sched = LrScheduler::new(1e-3, 0.0, 50, 10, LrDecay::Cosine);
        assert_eq!(sched.lr_at(60), 1e-3);
    }
}
