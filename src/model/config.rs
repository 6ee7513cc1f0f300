//! `config.json` and `generation_config.json`

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

pub const CONFIG_FILE: &str = "config.json";
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

pub const MODEL_TYPE: &str = "afinar_mlp";

/// One id or a list of ids (HF allows both for eos)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn first(&self) -> Option<u32> {
        match self {
            TokenIds::One(id) => Some(*id),
            TokenIds::Many(ids) => ids.first().copied(),
        }
    }

    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::One(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }
}

/// Architecture hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torch_dtype: Option<String>,
    /// Keys this crate does not interpret, written back unchanged
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_model_type() -> String {
    MODEL_TYPE.to_string()
}

impl ModelConfig {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        intermediate_size: usize,
        num_hidden_layers: usize,
    ) -> Self {
        Self {
            model_type: default_model_type(),
            vocab_size,
            hidden_size,
            intermediate_size,
            num_hidden_layers,
            bos_token_id: None,
            eos_token_id: None,
            torch_dtype: None,
            extra: Map::new(),
        }
    }

    pub fn with_eos_token_id(mut self, id: u32) -> Self {
        self.eos_token_id = Some(TokenIds::One(id));
        self
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Err(Error::NotFound(path));
        }
        let config: Self = serde_json::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.as_ref().join(CONFIG_FILE), json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.intermediate_size == 0 {
            return Err(Error::Model(format!(
                "config.json has a zero dimension (vocab {}, hidden {}, intermediate {})",
                self.vocab_size, self.hidden_size, self.intermediate_size
            )));
        }
        Ok(())
    }
}

/// Decoding defaults shipped with a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerationConfig {
    /// Load `generation_config.json`, falling back to defaults when absent
    pub fn load_or_default(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(GENERATION_CONFIG_FILE);
        if !path.exists() {
            tracing::debug!("no {} in {}, using defaults", GENERATION_CONFIG_FILE, dir.as_ref().display());
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.as_ref().join(GENERATION_CONFIG_FILE), json)?;
        Ok(())
    }

    /// Every id that ends generation
    pub fn eos_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }
}
