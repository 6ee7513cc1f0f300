//! HuggingFace tokenizer directory support

use std::fs;
use std::path::Path;

use serde_json::Value;
use tokenizers::Tokenizer;

use super::{ChatTemplate, TextTokenizer};
use crate::{Error, Result};

pub(crate) const TOKENIZER_FILE: &str = "tokenizer.json";
pub(crate) const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Tokenizer loaded from a model directory
pub struct PretrainedTokenizer {
    inner: Tokenizer,
    config: Value,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
    template: ChatTemplate,
}

impl PretrainedTokenizer {
    /// Load `tokenizer.json` (required) and `tokenizer_config.json` (optional).
    ///
    /// When the tokenizer config names no eos token, `config.json`'s
    /// `eos_token_id` is used instead.
    pub fn from_pretrained(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        if !tokenizer_path.exists() {
            return Err(Error::NotFound(tokenizer_path));
        }
        let inner = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            Error::Tokenizer(format!("failed to load {}: {e}", tokenizer_path.display()))
        })?;

        let config = read_optional_json(&dir.join(TOKENIZER_CONFIG_FILE))?;
        let mut tokenizer = Self::from_parts(inner, config);

        if tokenizer.eos_token_id.is_none() {
            let model_config = read_optional_json(&dir.join("config.json"))?;
            tokenizer.eos_token_id = first_id(model_config.get("eos_token_id"));
            if tokenizer.pad_token_id.is_none() {
                tokenizer.pad_token_id = tokenizer.eos_token_id;
            }
        }

        Ok(tokenizer)
    }

    /// Build from an in-memory tokenizer and its `tokenizer_config.json` value
    pub fn from_parts(inner: Tokenizer, config: Value) -> Self {
        let eos_token_id = special_token_id(&inner, config.get("eos_token"));
        let pad_token_id = special_token_id(&inner, config.get("pad_token")).or(eos_token_id);
        let template = ChatTemplate::detect(config.get("chat_template").and_then(Value::as_str));
        Self {
            inner,
            config,
            eos_token_id,
            pad_token_id,
            template,
        }
    }

    /// Write `tokenizer.json` and, if loaded, `tokenizer_config.json`
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        self.inner
            .save(dir.join(TOKENIZER_FILE), true)
            .map_err(|e| Error::Tokenizer(format!("failed to save tokenizer: {e}")))?;
        if !self.config.is_null() {
            let json = serde_json::to_string_pretty(&self.config)?;
            fs::write(dir.join(TOKENIZER_CONFIG_FILE), json)?;
        }
        Ok(())
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }
}

impl TextTokenizer for PretrainedTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn chat_template(&self) -> ChatTemplate {
        self.template
    }
}

fn read_optional_json(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Null);
    }
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Serialization(format!("{}: {e}", path.display())))
}

/// Special tokens are stored either as a plain string or as an
/// `AddedToken` object with a `content` field.
fn special_token_id(tokenizer: &Tokenizer, entry: Option<&Value>) -> Option<u32> {
    let content = match entry? {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("content")?.as_str()?,
        _ => return None,
    };
    tokenizer.token_to_id(content)
}

fn first_id(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::Array(items) => first_id(items.first()),
        _ => None,
    }
}
