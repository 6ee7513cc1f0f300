//! Learning rate schedulers with linear warmup

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Learning rate scheduler trait
pub trait LRScheduler {
    /// Learning rate for the current step
    fn get_lr(&self) -> f32;

    /// Advance by one optimizer step
    fn step(&mut self);
}

/// Decay shape after warmup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Constant,
    ConstantWithWarmup,
    Linear,
    Cosine,
}

impl FromStr for ScheduleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(ScheduleKind::Constant),
            "constant_with_warmup" => Ok(ScheduleKind::ConstantWithWarmup),
            "linear" => Ok(ScheduleKind::Linear),
            "cosine" => Ok(ScheduleKind::Cosine),
            other => Err(Error::Config(format!(
                "unknown lr_scheduler_type {other:?} (expected constant, constant_with_warmup, linear or cosine)"
            ))),
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleKind::Constant => "constant",
            ScheduleKind::ConstantWithWarmup => "constant_with_warmup",
            ScheduleKind::Linear => "linear",
            ScheduleKind::Cosine => "cosine",
        };
        f.write_str(s)
    }
}

/// Base learning rate times a multiplier that depends on the step.
///
/// During warmup the multiplier is `step / warmup_steps`, so step 0 runs at
/// zero. `constant` ignores warmup entirely.
#[derive(Debug, Clone)]
pub struct WarmupScheduler {
    kind: ScheduleKind,
    base_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl WarmupScheduler {
    pub fn new(kind: ScheduleKind, base_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    fn multiplier(&self) -> f32 {
        let step = self.current_step;
        if self.kind == ScheduleKind::Constant {
            return 1.0;
        }
        if step < self.warmup_steps {
            return step as f32 / self.warmup_steps.max(1) as f32;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f32;
        let progress = (step - self.warmup_steps) as f32 / decay_steps;
        match self.kind {
            ScheduleKind::Constant | ScheduleKind::ConstantWithWarmup => 1.0,
            ScheduleKind::Linear => (1.0 - progress).max(0.0),
            ScheduleKind::Cosine => (0.5 * (1.0 + (PI * progress.min(1.0)).cos())).max(0.0),
        }
    }
}

impl LRScheduler for WarmupScheduler {
    fn get_lr(&self) -> f32 {
        self.base_lr * self.multiplier()
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}
