//! PEFT-compatible `adapter_config.json`

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::LoraConfig;
use crate::{Error, Result};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Adapter configuration in the HuggingFace PEFT schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeftAdapterConfig {
    /// Always "LORA"
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f32,
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub lora_dropout: f32,
    /// "none", "all", or "lora_only"
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model_name_or_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_bias() -> String {
    "none".to_string()
}

impl PeftAdapterConfig {
    pub fn from_lora_config(config: &LoraConfig, base_model: Option<&str>) -> Self {
        Self {
            peft_type: "LORA".to_string(),
            r: config.rank,
            lora_alpha: config.alpha,
            target_modules: config.target_modules.iter().cloned().collect(),
            lora_dropout: config.dropout,
            bias: config.bias.clone(),
            base_model_name_or_path: base_model.map(String::from),
            task_type: Some(config.task_type.clone()),
            fan_in_fan_out: false,
            inference_mode: true,
        }
    }

    pub fn to_lora_config(&self) -> Result<LoraConfig> {
        if self.peft_type != "LORA" {
            return Err(Error::Config(format!(
                "unsupported adapter type {:?}, expected \"LORA\"",
                self.peft_type
            )));
        }
        if self.r == 0 {
            return Err(Error::Config("adapter rank must be positive".into()));
        }
        if self.fan_in_fan_out {
            return Err(Error::Config("fan_in_fan_out adapters are not supported".into()));
        }
        let mut config = LoraConfig::new(self.r, self.lora_alpha)
            .target_modules(&self.target_modules)
            .with_dropout(self.lora_dropout);
        config.bias = self.bias.clone();
        if let Some(task) = &self.task_type {
            config.task_type = task.clone();
        }
        Ok(config)
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
        if !path.exists() {
            return Err(Error::NotFound(path));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.as_ref().join(ADAPTER_CONFIG_FILE), json)?;
        Ok(())
    }
}
