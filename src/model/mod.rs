//! Causal language model: configuration, weights and the LoRA-capable network

mod causal_lm;
pub mod config;
mod device;
mod linear;
pub mod weights;

pub use causal_lm::{CausalLm, ModuleKind, EMBED_TOKENS, LM_HEAD};
pub use config::{GenerationConfig, ModelConfig, TokenIds};
pub use device::{CacheScope, DeviceCache, DevicePlacement, HostCache};
pub use linear::Linear;
pub use weights::{StateDict, WeightDtype};
