//! LoRA (Low-Rank Adaptation) adapters
//!
//! Adapters are attached to a frozen [`CausalLm`](crate::model::CausalLm),
//! trained, saved in the PEFT layout and finally merged into the base weights.

mod adapter;
mod config;
mod layer;
pub mod peft;
mod targets;

pub use adapter::{ParameterCount, PeftModel};
pub use config::LoraConfig;
pub use layer::{LoraCache, LoraLayer};
pub use peft::PeftAdapterConfig;
pub use targets::{find_all_linear_names, TrainMode};
