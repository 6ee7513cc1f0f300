//! Tokenization seam
//!
//! The formatter, collator and inference runner only see [`TextTokenizer`].
//! [`PretrainedTokenizer`] implements it on top of a HuggingFace
//! `tokenizer.json` + `tokenizer_config.json` pair.

mod hf;
pub mod template;

pub use hf::PretrainedTokenizer;
pub use template::{human_assistant_prompt, ChatMessage, ChatTemplate, Role};

use crate::Result;

/// Text ↔ token id conversion plus the special ids training needs
pub trait TextTokenizer: Send + Sync {
    /// Encode text to ids
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;

    /// Decode ids back to text
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn eos_token_id(&self) -> Option<u32>;

    /// Padding id, falling back to eos when the tokenizer defines none
    fn pad_token_id(&self) -> Option<u32> {
        self.eos_token_id()
    }

    fn vocab_size(&self) -> usize;

    /// Layout used by [`TextTokenizer::apply_chat_template`]
    fn chat_template(&self) -> ChatTemplate {
        ChatTemplate::HumanAssistant
    }

    /// Render messages through the chat template and encode the result
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<Vec<u32>> {
        let text = self.chat_template().render(messages, add_generation_prompt);
        self.encode(&text, false)
    }
}
