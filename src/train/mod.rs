//! Training loop for LoRA adapters
//!
//! - [`TrainingArguments`]: trainer knobs derived from resolved settings
//! - [`Trainer`]: epochs, gradient accumulation, cross-rank averaging,
//!   clipping, scheduling, logging and checkpoint rotation
//! - [`TrainerCallback`]: hooks into training events
//! - [`JsonlReporter`]: `report_to = jsonl`
//!
//! # Example
//!
//! ```no_run
//! use afinar::data::{PaddingCollator, TokenizedDataset};
//! use afinar::distributed::SingleProcess;
//! use afinar::lora::PeftModel;
//! use afinar::train::{Trainer, TrainingArguments};
//! # fn run(model: PeftModel, dataset: TokenizedDataset, args: TrainingArguments) -> afinar::Result<()> {
//! let mut trainer = Trainer::new(model, args, dataset, PaddingCollator::new(0), Box::new(SingleProcess))?;
//! let result = trainer.train()?;
//! println!("{} steps, loss {:.4}", result.global_step, result.training_loss);
//! # Ok(())
//! # }
//! ```

mod args;
pub mod callback;
pub mod loss;
mod report;
mod state;
mod trainer;

pub use args::{ReportTarget, SaveStrategy, TrainingArguments, TRAINING_ARGS_FILE};
pub use callback::{CallbackAction, CallbackContext, CallbackManager, TrainerCallback};
pub use loss::{shifted_cross_entropy, softmax, LossOutput};
pub use report::{JsonlReporter, METRICS_FILE};
pub use state::{LogRecord, TrainerState, TRAINER_STATE_FILE};
pub use trainer::{rotate_checkpoints, steps_per_epoch, TrainResult, Trainer, CHECKPOINT_PREFIX};
