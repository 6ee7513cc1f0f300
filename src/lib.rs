//! # Afinar: LoRA fine-tuning for small causal language models
//!
//! Afinar formats conversation records into supervised examples, trains a
//! LoRA adapter on a safetensors base model, folds the adapter back into the
//! base weights and runs greedy inference on the result.
//!
//! ## Architecture
//!
//! - **config**: CLI, layered config files and resolved settings
//! - **data**: conversation records, formatter, dataset and collator
//! - **tokenizer**: HuggingFace `tokenizer.json` and chat templates
//! - **model**: safetensors weights and a small causal LM
//! - **lora**: adapter injection, PEFT files, merge-and-unload
//! - **optim**: AdamW/SGD, warmup schedules, gradient clipping
//! - **train**: trainer loop, callbacks, checkpoints
//! - **distributed**: process groups for data-parallel training
//! - **merge**: adapter merge with CPU fallback and file backfill
//! - **infer**: single-prompt generation
//! - **run**: the end-to-end `train` pipeline

pub mod config;
pub mod data;
pub mod distributed;
pub mod infer;
pub mod logging;
pub mod lora;
pub mod merge;
pub mod model;
pub mod optim;
pub mod run;
pub mod tensor;
pub mod tokenizer;
pub mod train;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use tensor::Tensor;
