//! Resolved training settings

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::data::LengthPolicy;
use crate::distributed::local_rank_from_env;
use crate::lora::TrainMode;
use crate::optim::{OptimizerKind, ScheduleKind};
use crate::train::{ReportTarget, SaveStrategy};
use crate::Result;

/// Every knob of a training run, after defaults, config files and flags
/// have been layered. Keys match the `train` flags and config file keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    pub model_name_or_path: PathBuf,
    pub output_dir: PathBuf,
    pub train_file: PathBuf,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f32,
    pub max_seq_length: usize,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: usize,
    pub lr_scheduler_type: String,
    pub warmup_steps: usize,
    pub lora_rank: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    pub local_rank: i64,
    pub distributed: bool,
    pub gradient_checkpointing: bool,
    pub optim: String,
    pub train_mode: String,
    pub seed: u64,
    pub fp16: bool,
    pub report_to: Option<String>,
    pub dataloader_num_workers: usize,
    pub save_strategy: String,
    pub weight_decay: f32,
    pub max_grad_norm: f32,
    pub remove_unused_columns: bool,
    pub strict_max_length: bool,

    /// Keys from config files that no setting consumes
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            model_name_or_path: PathBuf::from("./ckpt/qwen"),
            output_dir: PathBuf::from("./output/task_name/lora"),
            train_file: PathBuf::from("./data/shuangseqiu_train.jsonl"),
            num_train_epochs: 1,
            per_device_train_batch_size: 1,
            gradient_accumulation_steps: 2,
            learning_rate: 2e-4,
            max_seq_length: 1024,
            logging_steps: 1,
            save_steps: 200,
            save_total_limit: 1,
            lr_scheduler_type: "constant_with_warmup".to_string(),
            warmup_steps: 28,
            lora_rank: 2,
            lora_alpha: 4.0,
            lora_dropout: 0.05,
            local_rank: local_rank_from_env(),
            distributed: false,
            gradient_checkpointing: true,
            optim: "adamw_torch".to_string(),
            train_mode: "lora".to_string(),
            seed: 42,
            fp16: false,
            report_to: None,
            dataloader_num_workers: 0,
            save_strategy: "steps".to_string(),
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            remove_unused_columns: true,
            strict_max_length: false,
            extra: Map::new(),
        }
    }
}

impl TrainSettings {
    pub fn scheduler_kind(&self) -> Result<ScheduleKind> {
        self.lr_scheduler_type.parse()
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind> {
        self.optim.parse()
    }

    pub fn save_strategy(&self) -> Result<SaveStrategy> {
        self.save_strategy.parse()
    }

    pub fn train_mode(&self) -> Result<TrainMode> {
        self.train_mode.parse()
    }

    pub fn report_target(&self) -> ReportTarget {
        ReportTarget::parse_lenient(self.report_to.as_deref().unwrap_or("none"))
    }

    pub fn length_policy(&self) -> LengthPolicy {
        LengthPolicy::from_strict(self.strict_max_length)
    }

    /// Directory the merged model is written to after training
    pub fn merged_output_dir(&self) -> PathBuf {
        self.output_dir.join("weight")
    }

    /// Log every resolved setting, one per line
    pub fn log(&self) {
        tracing::info!("training settings:");
        if let Ok(Value::Object(map)) = serde_json::to_value(self) {
            for (key, value) in &map {
                tracing::info!("  {key}: {value}");
            }
        }
    }
}
