//! LoRA configuration for target module selection
//!
//! Modules are matched by the last segment of their path, so `up_proj`
//! selects `model.layers.{i}.mlp.up_proj` in every layer.

use std::collections::BTreeSet;

/// Configuration for LoRA adapter targeting
#[derive(Clone, Debug, PartialEq)]
pub struct LoraConfig {
    /// LoRA rank
    pub rank: usize,
    /// LoRA alpha (scaling parameter)
    pub alpha: f32,
    /// Dropout on the adapter input during training
    pub dropout: f32,
    /// Target module names (last path segment)
    pub target_modules: BTreeSet<String>,
    /// Bias handling; only "none" is trained
    pub bias: String,
    pub task_type: String,
}

impl LoraConfig {
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            dropout: 0.0,
            target_modules: BTreeSet::new(),
            bias: "none".to_string(),
            task_type: "CAUSAL_LM".to_string(),
        }
    }

    pub fn target_modules<S: AsRef<str>>(mut self, modules: &[S]) -> Self {
        self.target_modules = modules.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Check if a module (full path or bare name) should get an adapter
    pub fn should_apply(&self, module_path: &str) -> bool {
        let name = module_path.rsplit('.').next().unwrap_or(module_path);
        self.target_modules.contains(name)
    }

    /// alpha / rank
    pub fn scale(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    pub fn num_target_modules(&self) -> usize {
        self.target_modules.len()
    }
}

impl Default for LoraConfig {
    /// rank=8, alpha=16, no targets
    fn default() -> Self {
        Self::new(8, 16.0)
    }
}
