//! Optimizer trait and name-based construction

use std::fmt;
use std::str::FromStr;

use super::{AdamW, Sgd};
use crate::{Error, Tensor};

/// Trait for optimization algorithms
///
/// Parameters are passed as mutable references so that tensors owned by
/// different modules can be updated together. The order must be stable
/// between calls: per-parameter state is matched by position.
pub trait Optimizer: Send {
    /// Perform a single optimization step
    fn step(&mut self, params: &mut [&mut Tensor]);

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [&mut Tensor]) {
        for param in params.iter_mut() {
            param.zero_grad();
        }
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);
}

/// Optimizer names accepted by `--optim`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    AdamW,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adamw_torch" | "adamw_hf" | "adamw" => Ok(OptimizerKind::AdamW),
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(Error::Config(format!(
                "unknown optimizer {other:?} (expected adamw_torch, adamw_hf, adamw or sgd)"
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::AdamW => write!(f, "adamw"),
            OptimizerKind::Sgd => write!(f, "sgd"),
        }
    }
}

impl OptimizerKind {
    pub fn build(self, lr: f32, weight_decay: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::AdamW => Box::new(AdamW::new(lr, 0.9, 0.999, 1e-8, weight_decay)),
            OptimizerKind::Sgd => Box::new(Sgd::new(lr, 0.0, weight_decay)),
        }
    }
}
