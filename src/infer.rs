//! Single-prompt inference on a (merged) model directory

use std::path::Path;

use crate::model::{CausalLm, DevicePlacement, GenerationConfig};
use crate::tokenizer::{ChatMessage, PretrainedTokenizer, TextTokenizer};
use crate::{Error, Result};

/// Greedy-decode a reply to `prompt` and return it as text.
///
/// The prompt is wrapped as one user message and rendered through the
/// model's chat template; the echoed prompt is removed before decoding.
pub fn model_reasoning(
    model_path: impl AsRef<Path>,
    prompt: &str,
    max_new_tokens: usize,
) -> Result<String> {
    let model_path = model_path.as_ref();
    let tokenizer = PretrainedTokenizer::from_pretrained(model_path)?;
    let model = CausalLm::from_pretrained(model_path, DevicePlacement::Auto)?;

    let generation = GenerationConfig::load_or_default(model_path)?;
    // Single-sequence greedy decoding never pads, so only the stop ids matter
    let eos_ids = stop_ids(&generation, &model, &tokenizer);
    tracing::debug!("stopping on {eos_ids:?}");

    let input_ids = tokenizer.apply_chat_template(&[ChatMessage::user(prompt)], true)?;
    if input_ids.is_empty() {
        return Err(Error::Tokenizer("chat template produced no tokens".into()));
    }

    let output = model.generate(&input_ids, max_new_tokens, &eos_ids)?;
    let reply = &output[input_ids.len()..];
    tracing::debug!("generated {} tokens", reply.len());
    tokenizer.decode(reply, true)
}

/// Generation config eos ids, else the model config's, else the tokenizer's
fn stop_ids(
    generation: &GenerationConfig,
    model: &CausalLm,
    tokenizer: &dyn TextTokenizer,
) -> Vec<u32> {
    let from_generation = generation.eos_ids();
    if !from_generation.is_empty() {
        return from_generation;
    }
    if let Some(ids) = &model.config().eos_token_id {
        return ids.to_vec();
    }
    tokenizer.eos_token_id().into_iter().collect()
}
