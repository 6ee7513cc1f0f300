//! Settings validation

use super::settings::TrainSettings;
use crate::Error;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid learning rate: {0} (must be > 0.0)")]
    InvalidLearningRate(f32),

    #[error("Invalid batch size: {0} (must be > 0)")]
    InvalidBatchSize(usize),

    #[error("Invalid gradient accumulation steps: {0} (must be > 0)")]
    InvalidGradientAccumulation(usize),

    #[error("Invalid epochs: {0} (must be > 0)")]
    InvalidEpochs(usize),

    #[error("Invalid max_seq_length: {0} (must be > 0)")]
    InvalidMaxSeqLength(usize),

    #[error("Invalid LoRA rank: {0} (must be > 0)")]
    InvalidLoRARank(usize),

    #[error("Invalid LoRA dropout: {0} (must be in [0, 1))")]
    InvalidLoRADropout(f32),

    #[error("Invalid LoRA alpha: {0} (must be > 0.0)")]
    InvalidLoRAAlpha(f32),

    #[error("{0}")]
    UnknownName(String),
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Config(e.to_string())
    }
}

/// Check ranges and every name-valued setting
pub fn validate_settings(settings: &TrainSettings) -> Result<(), ValidationError> {
    if settings.per_device_train_batch_size == 0 {
        return Err(ValidationError::InvalidBatchSize(
            settings.per_device_train_batch_size,
        ));
    }
    if settings.gradient_accumulation_steps == 0 {
        return Err(ValidationError::InvalidGradientAccumulation(
            settings.gradient_accumulation_steps,
        ));
    }
    if settings.num_train_epochs == 0 {
        return Err(ValidationError::InvalidEpochs(settings.num_train_epochs));
    }
    if settings.max_seq_length == 0 {
        return Err(ValidationError::InvalidMaxSeqLength(settings.max_seq_length));
    }
    if settings.learning_rate.is_nan() || settings.learning_rate <= 0.0 {
        return Err(ValidationError::InvalidLearningRate(settings.learning_rate));
    }
    if settings.lora_rank == 0 {
        return Err(ValidationError::InvalidLoRARank(settings.lora_rank));
    }
    if settings.lora_alpha.is_nan() || settings.lora_alpha <= 0.0 {
        return Err(ValidationError::InvalidLoRAAlpha(settings.lora_alpha));
    }
    if !(0.0..1.0).contains(&settings.lora_dropout) {
        return Err(ValidationError::InvalidLoRADropout(settings.lora_dropout));
    }

    let names = [
        settings.scheduler_kind().map(drop),
        settings.optimizer_kind().map(drop),
        settings.save_strategy().map(drop),
        settings.train_mode().map(drop),
    ];
    for result in names {
        if let Err(e) = result {
            return Err(ValidationError::UnknownName(match e {
                Error::Config(msg) => msg,
                other => other.to_string(),
            }));
        }
    }

    Ok(())
}
