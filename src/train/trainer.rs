//! Training loop for a LoRA-adapted causal LM
//!
//! One optimizer step consumes `gradient_accumulation_steps` micro-batches
//! (fewer at the end of an epoch). Before each step the accumulated gradients
//! are averaged over the micro-batches, averaged across ranks, then clipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::args::{ReportTarget, SaveStrategy, TrainingArguments};
use super::callback::{CallbackAction, CallbackContext, CallbackManager, TrainerCallback};
use super::report::JsonlReporter;
use super::state::{LogRecord, TrainerState};
use crate::data::{PaddingCollator, TokenizedDataset, TokenizedExample};
use crate::distributed::ProcessGroup;
use crate::lora::PeftModel;
use crate::optim::{clip_grad_norm, LRScheduler, Optimizer, WarmupScheduler};
use crate::{Error, Result, Tensor};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Result of a training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainResult {
    /// Optimizer steps taken
    pub global_step: usize,
    /// Mean loss over all optimizer steps
    pub training_loss: f32,
    pub epochs_completed: usize,
    /// Whether a callback stopped training
    pub stopped_early: bool,
    pub elapsed_secs: f64,
}

/// Optimizer steps in one epoch of `num_examples`
pub fn steps_per_epoch(num_examples: usize, batch_size: usize, accumulation: usize) -> usize {
    num_examples
        .div_ceil(batch_size.max(1))
        .div_ceil(accumulation.max(1))
}

pub struct Trainer {
    model: PeftModel,
    args: TrainingArguments,
    /// This rank's shard
    dataset: TokenizedDataset,
    collator: PaddingCollator,
    group: Box<dyn ProcessGroup>,
    optimizer: Box<dyn Optimizer>,
    scheduler: WarmupScheduler,
    callbacks: CallbackManager,
    state: TrainerState,
    steps_per_epoch: usize,
    start_time: Option<Instant>,
}

impl Trainer {
    /// Shard the dataset for this rank and build optimizer and schedule.
    ///
    /// With more than one rank every shard is cut to the same length so all
    /// ranks take the same number of steps.
    pub fn new(
        model: PeftModel,
        args: TrainingArguments,
        dataset: TokenizedDataset,
        collator: PaddingCollator,
        group: Box<dyn ProcessGroup>,
    ) -> Result<Self> {
        let world_size = group.world_size();
        let dataset = if world_size > 1 {
            let per_rank = dataset.len() / world_size;
            let mut shard = dataset.shard(group.rank(), world_size);
            shard.truncate(per_rank);
            shard
        } else {
            dataset
        };
        if dataset.is_empty() {
            return Err(Error::Config(format!(
                "no training examples for rank {} of {world_size}",
                group.rank()
            )));
        }

        let steps_per_epoch = steps_per_epoch(
            dataset.len(),
            args.per_device_train_batch_size,
            args.gradient_accumulation_steps,
        );
        let max_steps = steps_per_epoch * args.num_train_epochs;

        let optimizer = args
            .optimizer_kind()?
            .build(args.learning_rate, args.weight_decay);
        let scheduler = WarmupScheduler::new(
            args.scheduler_kind()?,
            args.learning_rate,
            args.warmup_steps,
            max_steps,
        );

        let mut callbacks = CallbackManager::new();
        if args.report_to == ReportTarget::Jsonl && group.is_main_process() {
            callbacks.add(JsonlReporter::open(&args.output_dir)?);
        }

        if args.gradient_checkpointing {
            tracing::debug!("gradient checkpointing requested; activations are kept in memory");
        }
        if args.fp16 {
            tracing::debug!("fp16 requested; adapter math runs in f32");
        }

        let state = TrainerState {
            max_steps,
            num_train_epochs: args.num_train_epochs,
            logging_steps: args.logging_steps,
            save_steps: args.save_steps,
            train_batch_size: args.per_device_train_batch_size,
            ..Default::default()
        };

        Ok(Self {
            model,
            args,
            dataset,
            collator,
            group,
            optimizer,
            scheduler,
            callbacks,
            state,
            steps_per_epoch,
            start_time: None,
        })
    }

    /// Add a callback to the trainer
    pub fn add_callback<C: TrainerCallback + 'static>(&mut self, callback: C) {
        self.callbacks.add(callback);
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn max_steps(&self) -> usize {
        self.state.max_steps
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn args(&self) -> &TrainingArguments {
        &self.args
    }

    pub fn model(&self) -> &PeftModel {
        &self.model
    }

    pub fn into_model(self) -> PeftModel {
        self.model
    }

    pub fn is_main_process(&self) -> bool {
        self.group.is_main_process()
    }

    /// Whether this process writes checkpoints, trainer state and the adapter.
    /// With `save_on_each_node` that is the first process of every node
    /// (`local_rank` 0, or -1 outside a launcher), otherwise global rank 0.
    pub fn should_save(&self) -> bool {
        if self.args.save_on_each_node {
            self.args.local_rank <= 0
        } else {
            self.is_main_process()
        }
    }

    /// Barrier across every rank of the trainer's process group
    pub fn barrier(&mut self) -> Result<()> {
        self.group.barrier()
    }

    fn context(&self, epoch: usize, step: usize, loss: f32, lr: f32) -> CallbackContext {
        CallbackContext {
            epoch,
            max_epochs: self.args.num_train_epochs,
            step,
            steps_per_epoch: self.steps_per_epoch,
            global_step: self.state.global_step,
            max_steps: self.state.max_steps,
            loss,
            lr,
            elapsed_secs: self
                .start_time
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    /// Shuffled example indices grouped into micro-batches
    fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.args.seed.wrapping_add(epoch as u64));
        indices.shuffle(&mut rng);
        indices
            .chunks(self.args.per_device_train_batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Run every epoch
    pub fn train(&mut self) -> Result<TrainResult> {
        let start = Instant::now();
        self.start_time = Some(start);
        let accumulation = self.args.gradient_accumulation_steps.max(1);
        // Dropout masks differ per rank; shuffling does not
        let mut dropout_rng =
            StdRng::seed_from_u64(self.args.seed.wrapping_add(1 + self.group.rank() as u64));

        if self.is_main_process() {
            tracing::info!("***** Running training *****");
            tracing::info!("  Num examples (this rank) = {}", self.dataset.len());
            tracing::info!("  Num epochs = {}", self.args.num_train_epochs);
            tracing::info!(
                "  Batch size per device = {}",
                self.args.per_device_train_batch_size
            );
            tracing::info!("  Gradient accumulation steps = {accumulation}");
            tracing::info!("  World size = {}", self.group.world_size());
            tracing::info!("  Total optimization steps = {}", self.state.max_steps);
        }

        let begin = self.context(0, 0, 0.0, 0.0);
        let mut stopped_early = self.callbacks.on_train_begin(&begin) == CallbackAction::Stop;
        let mut epochs_completed = 0;
        let mut loss_total = 0.0f32;
        let mut window_loss = 0.0f32;
        let mut window_steps = 0usize;

        'epochs: for epoch in 0..self.args.num_train_epochs {
            if stopped_early {
                break;
            }
            let batches = self.epoch_batches(epoch);
            let num_batches = batches.len();
            let mut step_in_epoch = 0;
            let mut micro_loss = 0.0f32;
            let mut micro_count = 0usize;
            self.model.model_mut().zero_grad();

            for (i, indices) in batches.iter().enumerate() {
                let examples: Vec<&TokenizedExample> = indices
                    .iter()
                    .filter_map(|&j| self.dataset.get(j))
                    .collect();
                let batch = self.collator.collate(&examples);
                let out = self
                    .model
                    .model_mut()
                    .loss_and_backward(&batch, Some(&mut dropout_rng))?;
                micro_loss += out.loss;
                micro_count += 1;

                let boundary = (i + 1) % accumulation == 0 || i + 1 == num_batches;
                if !boundary {
                    continue;
                }

                let step_loss = micro_loss / micro_count as f32;
                let (lr, grad_norm) = self.optimizer_step(micro_count)?;
                micro_loss = 0.0;
                micro_count = 0;
                step_in_epoch += 1;
                self.state.global_step += 1;
                self.state.epoch = epoch as f64 + step_in_epoch as f64 / self.steps_per_epoch as f64;
                loss_total += step_loss;
                window_loss += step_loss;
                window_steps += 1;

                let ctx = self.context(epoch, step_in_epoch, step_loss, lr);
                let logging_steps = self.args.logging_steps;
                if logging_steps > 0 && self.state.global_step % logging_steps == 0 {
                    self.log(&ctx, window_loss / window_steps as f32, lr, grad_norm);
                    window_loss = 0.0;
                    window_steps = 0;
                }

                if self.args.save_strategy == SaveStrategy::Steps
                    && self.args.save_steps > 0
                    && self.state.global_step % self.args.save_steps == 0
                {
                    self.save_checkpoint(&ctx)?;
                }

                if self.callbacks.on_step_end(&ctx) == CallbackAction::Stop {
                    stopped_early = true;
                    break 'epochs;
                }
            }

            epochs_completed += 1;
            let ctx = self.context(epoch, step_in_epoch, 0.0, self.scheduler.get_lr());
            if self.args.save_strategy == SaveStrategy::Epoch {
                self.save_checkpoint(&ctx)?;
            }
            if self.callbacks.on_epoch_end(&ctx) == CallbackAction::Stop {
                stopped_early = true;
                break;
            }
        }

        let training_loss = loss_total / self.state.global_step.max(1) as f32;
        if self.should_save() {
            fs::create_dir_all(&self.args.output_dir)?;
            self.state.save(&self.args.output_dir)?;
            tracing::info!(
                "training finished: {} steps, mean loss {training_loss:.4}",
                self.state.global_step
            );
        }
        let ctx = self.context(epochs_completed, 0, training_loss, self.scheduler.get_lr());
        self.callbacks.on_train_end(&ctx);

        Ok(TrainResult {
            global_step: self.state.global_step,
            training_loss,
            epochs_completed,
            stopped_early,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Average, synchronise, clip and apply the accumulated gradients.
    /// Returns the learning rate used and the pre-clip gradient norm.
    fn optimizer_step(&mut self, micro_batches: usize) -> Result<(f32, f32)> {
        let mut params = self.model.model_mut().trainable_params();
        average_gradients(&mut params, micro_batches, self.group.as_mut())?;
        let grad_norm = clip_grad_norm(&mut params, self.args.max_grad_norm);

        let lr = self.scheduler.get_lr();
        self.optimizer.set_lr(lr);
        self.optimizer.step(&mut params);
        self.optimizer.zero_grad(&mut params);
        self.scheduler.step();
        Ok((lr, grad_norm))
    }

    fn log(&mut self, ctx: &CallbackContext, loss: f32, lr: f32, grad_norm: f32) {
        let record = LogRecord {
            loss,
            learning_rate: lr,
            grad_norm,
            epoch: self.state.epoch,
            step: self.state.global_step,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        if self.is_main_process() {
            tracing::info!(
                "{{'loss': {:.4}, 'grad_norm': {:.4}, 'learning_rate': {:e}, 'epoch': {:.2}}}",
                record.loss,
                record.grad_norm,
                record.learning_rate,
                record.epoch
            );
        }
        self.callbacks.on_log(ctx, &record);
        self.state.log_history.push(record);
    }

    /// Write `checkpoint-{step}` and rotate old ones
    fn save_checkpoint(&mut self, ctx: &CallbackContext) -> Result<()> {
        if !self.should_save() {
            return Ok(());
        }
        let dir = self
            .args
            .output_dir
            .join(format!("{CHECKPOINT_PREFIX}{}", self.state.global_step));
        self.model.save_pretrained(&dir)?;
        self.args.save(&dir)?;
        self.state.save(&dir)?;
        tracing::info!("saved checkpoint {}", dir.display());

        if let Some(limit) = self.args.save_total_limit {
            for removed in rotate_checkpoints(&self.args.output_dir, limit)? {
                tracing::debug!("removed old checkpoint {}", removed.display());
            }
        }
        self.callbacks.on_save(ctx, &dir);
        Ok(())
    }

    /// Save the adapter and `training_args.json` into `dir` when [`Self::should_save`]
    pub fn save_model(&self, dir: impl AsRef<Path>) -> Result<()> {
        if !self.should_save() {
            return Ok(());
        }
        let dir = dir.as_ref();
        self.model.save_pretrained(dir)?;
        self.args.save(dir)?;
        tracing::info!("saved adapter to {}", dir.display());
        Ok(())
    }
}

/// Divide gradients by the micro-batch count, then replace them with their
/// mean across ranks. Parameters without a gradient contribute zeros.
fn average_gradients(
    params: &mut [&mut Tensor],
    micro_batches: usize,
    group: &mut dyn ProcessGroup,
) -> Result<()> {
    let scale = 1.0 / micro_batches.max(1) as f32;
    for param in params.iter_mut() {
        if let Some(grad) = param.grad_mut() {
            grad.mapv_inplace(|g| g * scale);
        }
    }
    if group.world_size() == 1 {
        return Ok(());
    }

    let mut flat = Vec::with_capacity(params.iter().map(|p| p.len()).sum());
    for param in params.iter() {
        match param.grad() {
            Some(grad) => flat.extend(grad.iter().copied()),
            None => flat.resize(flat.len() + param.len(), 0.0),
        }
    }
    group.all_reduce_mean(&mut flat)?;

    let mut offset = 0;
    for param in params.iter_mut() {
        let [rows, cols] = param.shape();
        let n = rows * cols;
        let grad = Array2::from_shape_vec((rows, cols), flat[offset..offset + n].to_vec())
            .map_err(|e| Error::Model(format!("gradient reshape: {e}")))?;
        param.set_grad(grad);
        offset += n;
    }
    Ok(())
}

/// Delete the oldest `checkpoint-{step}` directories until at most `limit`
/// remain. Returns the removed paths.
pub fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    let mut checkpoints: Vec<(usize, PathBuf)> = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let step = name
            .to_str()
            .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(step) = step {
            checkpoints.push((step, entry.path()));
        }
    }
    checkpoints.sort_by_key(|(step, _)| *step);

    let excess = checkpoints.len().saturating_sub(limit);
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in checkpoints.into_iter().take(excess) {
        fs::remove_dir_all(&path)?;
        removed.push(path);
    }
    Ok(removed)
}
