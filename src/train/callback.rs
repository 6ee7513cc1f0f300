//! Callback system for training events
//!
//! Hooks fired by [`Trainer`](super::Trainer):
//! - `on_train_begin` / `on_train_end`
//! - `on_step_end` after every optimizer step
//! - `on_epoch_end`
//! - `on_log` whenever a log record is produced
//! - `on_save` after a checkpoint is written
//!
//! # Example
//!
//! ```rust
//! use afinar::train::{CallbackAction, CallbackContext, TrainerCallback};
//!
//! struct StopAfter(usize);
//!
//! impl TrainerCallback for StopAfter {
//!     fn on_step_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
//!         if ctx.global_step >= self.0 {
//!             CallbackAction::Stop
//!         } else {
//!             CallbackAction::Continue
//!         }
//!     }
//! }
//! ```

use std::path::Path;

use super::state::LogRecord;

/// Context passed to callbacks with current training state
#[derive(Clone, Debug, Default)]
pub struct CallbackContext {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    /// Total epochs planned
    pub max_epochs: usize,
    /// Optimizer steps completed in this epoch
    pub step: usize,
    /// Optimizer steps per epoch
    pub steps_per_epoch: usize,
    /// Optimizer steps completed overall
    pub global_step: usize,
    /// Planned optimizer steps
    pub max_steps: usize,
    /// Loss of the latest optimizer step
    pub loss: f32,
    /// Learning rate used for the latest optimizer step
    pub lr: f32,
    /// Training duration in seconds
    pub elapsed_secs: f64,
}

/// Action to take after a callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// Continue training normally
    Continue,
    /// Stop training after the current step
    Stop,
}

/// Trait for training callbacks
///
/// Every method has a no-op default, so implementors only override the
/// events they care about.
pub trait TrainerCallback: Send {
    /// Called before training starts
    fn on_train_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called after training ends
    fn on_train_end(&mut self, _ctx: &CallbackContext) {}

    /// Called after each optimizer step
    fn on_step_end(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called after each epoch
    fn on_epoch_end(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called with every log record
    fn on_log(&mut self, _ctx: &CallbackContext, _record: &LogRecord) {}

    /// Called after a checkpoint directory has been written
    fn on_save(&mut self, _ctx: &CallbackContext, _checkpoint: &Path) {}

    /// Get callback name for logging
    fn name(&self) -> &str {
        "TrainerCallback"
    }
}

// =============================================================================
// Callback Manager
// =============================================================================

/// Manages multiple callbacks and dispatches events
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn TrainerCallback>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<C: TrainerCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn add_boxed(&mut self, callback: Box<dyn TrainerCallback>) {
        self.callbacks.push(callback);
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Fire train begin event
    pub fn on_train_begin(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.until_stop(|cb| cb.on_train_begin(ctx))
    }

    /// Fire train end event
    pub fn on_train_end(&mut self, ctx: &CallbackContext) {
        for cb in &mut self.callbacks {
            cb.on_train_end(ctx);
        }
    }

    /// Fire step end event
    pub fn on_step_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.until_stop(|cb| cb.on_step_end(ctx))
    }

    /// Fire epoch end event
    pub fn on_epoch_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.until_stop(|cb| cb.on_epoch_end(ctx))
    }

    pub fn on_log(&mut self, ctx: &CallbackContext, record: &LogRecord) {
        for cb in &mut self.callbacks {
            cb.on_log(ctx, record);
        }
    }

    pub fn on_save(&mut self, ctx: &CallbackContext, checkpoint: &Path) {
        for cb in &mut self.callbacks {
            cb.on_save(ctx, checkpoint);
        }
    }

    fn until_stop<F>(&mut self, mut fire: F) -> CallbackAction
    where
        F: FnMut(&mut dyn TrainerCallback) -> CallbackAction,
    {
        for cb in &mut self.callbacks {
            if fire(cb.as_mut()) == CallbackAction::Stop {
                tracing::info!("{} requested stop", cb.name());
                return CallbackAction::Stop;
            }
        }
        CallbackAction::Continue
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter {
        steps: Arc<AtomicUsize>,
        logs: Arc<AtomicUsize>,
        stop_at: Option<usize>,
    }

    impl TrainerCallback for Counter {
        fn on_step_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
            self.steps.fetch_add(1, Ordering::SeqCst);
            match self.stop_at {
                Some(n) if ctx.global_step >= n => CallbackAction::Stop,
                _ => CallbackAction::Continue,
            }
        }

        fn on_log(&mut self, _ctx: &CallbackContext, _record: &LogRecord) {
            self.logs.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            "Counter"
        }
    }

    #[test]
    fn test_context_default() {
        let ctx = CallbackContext::default();
        assert_eq!(ctx.epoch, 0);
        assert_eq!(ctx.loss, 0.0);
    }

    #[test]
    fn test_manager_dispatches_to_all() {
        let steps = Arc::new(AtomicUsize::new(0));
        let logs = Arc::new(AtomicUsize::new(0));
        let mut manager = CallbackManager::new();
        for _ in 0..2 {
            manager.add(Counter {
                steps: steps.clone(),
                logs: logs.clone(),
                stop_at: None,
            });
        }
        assert_eq!(manager.len(), 2);

        let ctx = CallbackContext::default();
        assert_eq!(manager.on_step_end(&ctx), CallbackAction::Continue);
        manager.on_log(&ctx, &LogRecord::default());
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(logs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_short_circuits() {
        let steps = Arc::new(AtomicUsize::new(0));
        let mut manager = CallbackManager::new();
        manager.add(Counter {
            steps: steps.clone(),
            stop_at: Some(1),
            ..Default::default()
        });
        manager.add(Counter {
            steps: steps.clone(),
            ..Default::default()
        });

        let ctx = CallbackContext {
            global_step: 1,
            ..Default::default()
        };
        assert_eq!(manager.on_step_end(&ctx), CallbackAction::Stop);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_manager_continues() {
        let mut manager = CallbackManager::new();
        assert!(manager.is_empty());
        assert_eq!(
            manager.on_train_begin(&CallbackContext::default()),
            CallbackAction::Continue
        );
    }
}
