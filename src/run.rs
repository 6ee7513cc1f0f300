//! The `train` pipeline: data, model, adapter, trainer, merge

use std::env;
use std::fs;
use std::path::PathBuf;

use crate::config::TrainSettings;
use crate::data::{read_jsonl, PaddingCollator, TokenizedDataset};
use crate::distributed::{init_process_group, DistributedEnv};
use crate::lora::{find_all_linear_names, LoraConfig, PeftModel};
use crate::merge::{merge_lora_to_base_model, MergeOutcome};
use crate::model::{CausalLm, DevicePlacement};
use crate::tokenizer::{PretrainedTokenizer, TextTokenizer};
use crate::train::{TrainResult, Trainer, TrainingArguments};
use crate::{Error, Result};

/// What a finished `train` run produced
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub result: TrainResult,
    pub num_examples: usize,
    pub target_modules: Vec<String>,
    /// Adapter directory (`output_dir`)
    pub adapter_dir: PathBuf,
    /// `None` on ranks that skip the merge
    pub merge: Option<MergeOutcome>,
}

/// Only the process with `LOCAL_RANK` 0 (or unset) merges
fn merges_on_this_process(local_rank: Option<&str>) -> bool {
    local_rank.map_or(true, |v| v.trim() == "0")
}

/// Trainable parameters are reported at info level for `--local_rank 0` only
fn reports_trainable_parameters(local_rank: i64) -> bool {
    local_rank == 0
}

/// Fine-tune an adapter with `settings`, save it, and merge it into the base.
pub fn run_training(settings: &TrainSettings) -> Result<TrainReport> {
    if settings.distributed {
        DistributedEnv::default().apply();
    }

    fs::create_dir_all(&settings.output_dir)?;
    settings.log();

    let tokenizer = PretrainedTokenizer::from_pretrained(&settings.model_name_or_path)?;
    let records = read_jsonl(&settings.train_file)?;
    let dataset = TokenizedDataset::from_records(
        &records,
        &tokenizer,
        settings.max_seq_length,
        settings.length_policy(),
        settings.dataloader_num_workers,
    )?;
    tracing::info!(
        "{} examples, {} tokens from {}",
        dataset.len(),
        dataset.num_tokens(),
        settings.train_file.display()
    );
    let pad_id = tokenizer
        .pad_token_id()
        .ok_or_else(|| Error::Tokenizer("tokenizer defines neither pad nor eos token".into()))?;
    let collator = PaddingCollator::new(pad_id);

    let base = CausalLm::from_pretrained(&settings.model_name_or_path, DevicePlacement::Auto)?;
    let target_modules = find_all_linear_names(&base, settings.train_mode()?);
    tracing::info!("LoRA target modules: {target_modules:?}");
    let lora_config = LoraConfig::new(settings.lora_rank, settings.lora_alpha)
        .target_modules(&target_modules)
        .with_dropout(settings.lora_dropout);
    let model = PeftModel::inject(base, lora_config, settings.seed)?
        .with_base_model_name(settings.model_name_or_path.to_string_lossy());

    let group = init_process_group(settings.distributed, settings.local_rank)?;
    if reports_trainable_parameters(settings.local_rank) {
        model.print_trainable_parameters();
    } else {
        tracing::debug!("{}", model.parameter_count());
    }

    let args = TrainingArguments::from_settings(settings)?;
    let num_examples = dataset.len();
    let mut trainer = Trainer::new(model, args, dataset, collator, group)?;
    let result = trainer.train()?;
    trainer.save_model(&settings.output_dir)?;

    // The merge reads the adapter this process just wrote
    let merge = if trainer.should_save()
        && merges_on_this_process(env::var("LOCAL_RANK").ok().as_deref())
    {
        Some(merge_lora_to_base_model(
            &settings.model_name_or_path,
            &settings.output_dir,
            settings.merged_output_dir(),
        ))
    } else {
        None
    };

    if settings.distributed {
        trainer.barrier()?;
    }

    Ok(TrainReport {
        result,
        num_examples,
        target_modules,
        adapter_dir: settings.output_dir.clone(),
        merge,
    })
}
