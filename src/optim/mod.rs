//! Optimizers, learning rate schedules and gradient clipping

mod adamw;
mod clip;
mod optimizer;
mod scheduler;
mod sgd;

pub use adamw::AdamW;
pub use clip::clip_grad_norm;
pub use optimizer::{Optimizer, OptimizerKind};
pub use scheduler::{LRScheduler, ScheduleKind, WarmupScheduler};
pub use sgd::Sgd;
