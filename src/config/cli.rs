//! Command-line interface
//!
//! ```bash
//! afinar train --config run.json --learning_rate 1e-4
//! afinar merge --base ./ckpt/qwen --adapter ./output/lora --output ./output/lora/weight
//! afinar infer --model ./output/lora/weight --prompt "..."
//! ```
//!
//! Every `train` flag is optional so that the flags actually typed on the
//! command line can be told apart from defaults when settings are layered.

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::Result;

/// afinar: LoRA fine-tuning for small causal language models
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "afinar")]
#[command(version)]
#[command(about = "LoRA fine-tuning, adapter merging and inference for causal language models")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Fine-tune a LoRA adapter, then merge it into the base model
    Train(TrainArgs),

    /// Fold an adapter into its base model
    Merge(MergeArgs),

    /// Generate a completion for one prompt
    Infer(InferArgs),
}

/// Arguments for the train command
#[derive(Parser, Debug, Clone, PartialEq, Default, Serialize)]
#[command(rename_all = "snake_case")]
pub struct TrainArgs {
    /// JSON or YAML file with setting overrides
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Local model directory (config.json, tokenizer.json, weights)
    #[arg(long)]
    pub model_name_or_path: Option<String>,

    /// Where the adapter, checkpoints and merged weights are written
    #[arg(long)]
    pub output_dir: Option<String>,

    /// JSON-lines training data
    #[arg(long)]
    pub train_file: Option<String>,

    #[arg(long)]
    pub num_train_epochs: Option<usize>,

    #[arg(long)]
    pub per_device_train_batch_size: Option<usize>,

    #[arg(long)]
    pub gradient_accumulation_steps: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f32>,

    #[arg(long)]
    pub max_seq_length: Option<usize>,

    /// Log every N optimizer steps
    #[arg(long)]
    pub logging_steps: Option<usize>,

    /// Checkpoint every N optimizer steps (save_strategy=steps)
    #[arg(long)]
    pub save_steps: Option<usize>,

    /// Checkpoints kept on disk (0 keeps all)
    #[arg(long)]
    pub save_total_limit: Option<usize>,

    /// constant, constant_with_warmup, linear or cosine
    #[arg(long)]
    pub lr_scheduler_type: Option<String>,

    #[arg(long)]
    pub warmup_steps: Option<usize>,

    #[arg(long)]
    pub lora_rank: Option<usize>,

    #[arg(long)]
    pub lora_alpha: Option<f32>,

    #[arg(long)]
    pub lora_dropout: Option<f32>,

    /// Rank of this process on its node (-1 when not distributed)
    #[arg(long, allow_hyphen_values = true)]
    pub local_rank: Option<i64>,

    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub distributed: Option<bool>,

    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub gradient_checkpointing: Option<bool>,

    /// adamw_torch, adamw_hf, adamw or sgd
    #[arg(long)]
    pub optim: Option<String>,

    /// lora or qlora
    #[arg(long)]
    pub train_mode: Option<String>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub fp16: Option<bool>,

    /// none or jsonl
    #[arg(long)]
    pub report_to: Option<String>,

    #[arg(long)]
    pub dataloader_num_workers: Option<usize>,

    /// steps, epoch or no
    #[arg(long)]
    pub save_strategy: Option<String>,

    #[arg(long)]
    pub weight_decay: Option<f32>,

    /// Global gradient norm cap (<= 0 disables clipping)
    #[arg(long)]
    pub max_grad_norm: Option<f32>,

    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub remove_unused_columns: Option<bool>,

    /// Re-truncate prompt + answer + eos to max_seq_length
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub strict_max_length: Option<bool>,
}

impl TrainArgs {
    /// Settings given explicitly on the command line, keyed like the config files
    pub fn explicit_overrides(&self) -> Result<Map<String, Value>> {
        let overrides = match serde_json::to_value(self)? {
            Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            _ => Map::new(),
        };
        Ok(overrides)
    }
}

/// Arguments for the merge command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct MergeArgs {
    /// Base model directory
    #[arg(long)]
    pub base: PathBuf,

    /// Adapter directory (adapter_config.json + adapter_model.safetensors)
    #[arg(long)]
    pub adapter: PathBuf,

    /// Output directory for the merged model
    #[arg(long)]
    pub output: PathBuf,
}

/// Arguments for the infer command
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(rename_all = "snake_case")]
pub struct InferArgs {
    /// Merged model directory
    #[arg(long)]
    pub model: PathBuf,

    #[arg(long)]
    pub prompt: String,

    #[arg(long, default_value_t = 2048)]
    pub max_new_tokens: usize,
}

/// Parse command-line arguments
pub fn parse_args<I, T>(args: I) -> std::result::Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}
