//! Trainer state: log history and progress, saved as `trainer_state.json`

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{Error, Result};

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// One entry of the log history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Mean loss over the optimizer steps since the previous record
    pub loss: f32,
    pub learning_rate: f32,
    /// Global gradient norm of the latest step, before clipping
    pub grad_norm: f32,
    /// Fractional epoch, e.g. 1.5 halfway through the second epoch
    pub epoch: f64,
    pub step: usize,
    /// RFC 3339 wall-clock time
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
}

/// Progress of a training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub max_steps: usize,
    pub epoch: f64,
    pub num_train_epochs: usize,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub train_batch_size: usize,
    pub log_history: Vec<LogRecord>,
}

impl TrainerState {
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(TRAINER_STATE_FILE);
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(TRAINER_STATE_FILE);
        let text = fs::read_to_string(&path).map_err(|_| Error::NotFound(path.clone()))?;
        Ok(serde_json::from_str(&text)?)
    }
}
