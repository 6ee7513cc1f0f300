//! Trainer arguments derived from resolved settings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::TrainSettings;
use crate::optim::{OptimizerKind, ScheduleKind};
use crate::{Error, Result};

pub const TRAINING_ARGS_FILE: &str = "training_args.json";

/// When checkpoints are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStrategy {
    /// Every `save_steps` optimizer steps
    #[default]
    Steps,
    /// At the end of every epoch
    Epoch,
    No,
}

impl FromStr for SaveStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "steps" => Ok(SaveStrategy::Steps),
            "epoch" => Ok(SaveStrategy::Epoch),
            "no" => Ok(SaveStrategy::No),
            other => Err(Error::Config(format!(
                "unknown save_strategy {other:?} (expected steps, epoch or no)"
            ))),
        }
    }
}

impl fmt::Display for SaveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveStrategy::Steps => write!(f, "steps"),
            SaveStrategy::Epoch => write!(f, "epoch"),
            SaveStrategy::No => write!(f, "no"),
        }
    }
}

/// Where training logs are reported besides the tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportTarget {
    #[default]
    None,
    /// Append every log record to `<output_dir>/metrics.jsonl`
    Jsonl,
}

impl ReportTarget {
    /// Unsupported trackers fall back to `None` with a warning
    pub fn parse_lenient(name: &str) -> Self {
        match name.trim() {
            "" | "none" => ReportTarget::None,
            "jsonl" => ReportTarget::Jsonl,
            other => {
                tracing::warn!("report_to={other:?} is not supported, reporting disabled");
                ReportTarget::None
            }
        }
    }
}

/// Everything the trainer needs, in one place, saved next to the adapter.
///
/// Distributed and single-process runs share this one builder; the
/// `distributed` flag only changes `local_rank` and gradient checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f32,
    pub lr_scheduler_type: String,
    pub warmup_steps: usize,
    pub optim: String,
    pub weight_decay: f32,
    pub max_grad_norm: f32,
    pub logging_steps: usize,
    pub save_strategy: SaveStrategy,
    pub save_steps: usize,
    /// `None` keeps every checkpoint
    pub save_total_limit: Option<usize>,
    pub save_on_each_node: bool,
    pub seed: u64,
    pub local_rank: i64,
    pub gradient_checkpointing: bool,
    pub ddp_find_unused_parameters: bool,
    pub fp16: bool,
    pub bf16: bool,
    pub report_to: ReportTarget,
    pub dataloader_num_workers: usize,
    pub remove_unused_columns: bool,
}

impl TrainingArguments {
    pub fn from_settings(settings: &TrainSettings) -> Result<Self> {
        let distributed = settings.distributed;
        Ok(Self {
            output_dir: settings.output_dir.clone(),
            num_train_epochs: settings.num_train_epochs,
            per_device_train_batch_size: settings.per_device_train_batch_size,
            gradient_accumulation_steps: settings.gradient_accumulation_steps,
            learning_rate: settings.learning_rate,
            lr_scheduler_type: settings.scheduler_kind()?.to_string(),
            warmup_steps: settings.warmup_steps,
            optim: settings.optim.clone(),
            weight_decay: settings.weight_decay,
            max_grad_norm: settings.max_grad_norm,
            logging_steps: settings.logging_steps,
            save_strategy: settings.save_strategy()?,
            save_steps: settings.save_steps,
            save_total_limit: (settings.save_total_limit > 0).then_some(settings.save_total_limit),
            save_on_each_node: true,
            seed: settings.seed,
            local_rank: if distributed { settings.local_rank } else { -1 },
            gradient_checkpointing: !distributed && settings.gradient_checkpointing,
            ddp_find_unused_parameters: false,
            fp16: settings.fp16,
            bf16: !settings.fp16,
            report_to: settings.report_target(),
            dataloader_num_workers: settings.dataloader_num_workers,
            // Only tokenized columns exist by the time the trainer runs
            remove_unused_columns: false,
        })
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind> {
        self.optim.parse()
    }

    pub fn scheduler_kind(&self) -> Result<ScheduleKind> {
        self.lr_scheduler_type.parse()
    }

    /// Write `training_args.json` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(TRAINING_ARGS_FILE);
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(TRAINING_ARGS_FILE);
        let text = fs::read_to_string(&path).map_err(|_| Error::NotFound(path.clone()))?;
        Ok(serde_json::from_str(&text)?)
    }
}
