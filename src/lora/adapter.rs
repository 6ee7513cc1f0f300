//! Base model wrapped with LoRA adapters
//!
//! Adapters are stored the way PEFT stores them:
//! `base_model.model.{module}.lora_A.weight` / `lora_B.weight` in
//! `adapter_model.safetensors`, plus `adapter_config.json`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::peft::{PeftAdapterConfig, ADAPTER_WEIGHTS_FILE};
use super::{LoraConfig, LoraLayer};
use crate::model::weights::{self, StateDict, WeightDtype};
use crate::model::CausalLm;
use crate::{Error, Result};

const PEFT_PREFIX: &str = "base_model.model.";

/// Trainable vs total parameter counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCount {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterCount {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl fmt::Display for ParameterCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

/// A [`CausalLm`] with adapters attached to its target modules
#[derive(Debug, Clone)]
pub struct PeftModel {
    model: CausalLm,
    config: LoraConfig,
    adapted: Vec<String>,
    base_model_name: Option<String>,
}

impl PeftModel {
    /// Attach freshly initialised adapters to every module the config targets
    pub fn inject(mut model: CausalLm, config: LoraConfig, seed: u64) -> Result<Self> {
        if config.rank == 0 {
            return Err(Error::InvalidParameter("LoRA rank must be positive".into()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut adapted = Vec::new();
        for (name, linear) in model.linears_mut() {
            if !config.should_apply(&name) {
                continue;
            }
            let lora = LoraLayer::new(
                linear.out_features(),
                linear.in_features(),
                config.rank,
                config.alpha,
                config.dropout,
                &mut rng,
            );
            linear.attach_lora(lora)?;
            adapted.push(name);
        }

        if adapted.is_empty() {
            return Err(Error::Config(format!(
                "no target modules matched {:?}",
                config.target_modules
            )));
        }
        tracing::debug!("attached LoRA to {} modules", adapted.len());

        Ok(Self {
            model,
            config,
            adapted,
            base_model_name: None,
        })
    }

    /// Load a saved adapter directory on top of `model`
    pub fn from_pretrained(mut model: CausalLm, adapter_dir: impl AsRef<Path>) -> Result<Self> {
        let adapter_dir = adapter_dir.as_ref();
        let peft_config = PeftAdapterConfig::load(adapter_dir)?;
        let config = peft_config.to_lora_config()?;
        let (mut tensors, _) = weights::load_file(adapter_dir.join(ADAPTER_WEIGHTS_FILE))?;

        let mut adapted = Vec::new();
        for (name, linear) in model.linears_mut() {
            let a_key = format!("{PEFT_PREFIX}{name}.lora_A.weight");
            let b_key = format!("{PEFT_PREFIX}{name}.lora_B.weight");
            match (tensors.remove(&a_key), tensors.remove(&b_key)) {
                (Some(a), Some(b)) => {
                    let lora = LoraLayer::from_weights(a, b, config.alpha, config.dropout)?;
                    linear.attach_lora(lora)?;
                    adapted.push(name);
                }
                (None, None) => {}
                _ => return Err(Error::MissingTensor(format!("{a_key} / {b_key}"))),
            }
        }

        if !tensors.is_empty() {
            let names: Vec<&String> = tensors.keys().collect();
            return Err(Error::Model(format!(
                "adapter has tensors for modules not in the base model: {names:?}"
            )));
        }
        if adapted.is_empty() {
            return Err(Error::Model(format!(
                "adapter in {} contains no LoRA weights",
                adapter_dir.display()
            )));
        }

        Ok(Self {
            model,
            config,
            adapted,
            base_model_name: peft_config.base_model_name_or_path,
        })
    }

    pub fn with_base_model_name(mut self, name: impl Into<String>) -> Self {
        self.base_model_name = Some(name.into());
        self
    }

    /// Write `adapter_config.json` and `adapter_model.safetensors`
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        PeftAdapterConfig::from_lora_config(&self.config, self.base_model_name.as_deref())
            .save(dir)?;

        let mut state = StateDict::new();
        for (name, linear) in self.model.linears() {
            if let Some(lora) = linear.lora() {
                state.insert(
                    format!("{PEFT_PREFIX}{name}.lora_A.weight"),
                    lora.lora_a().data().clone(),
                );
                state.insert(
                    format!("{PEFT_PREFIX}{name}.lora_B.weight"),
                    lora.lora_b().data().clone(),
                );
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        weights::save_file(
            dir.join(ADAPTER_WEIGHTS_FILE),
            &state,
            WeightDtype::F32,
            Some(metadata),
        )
    }

    /// Fold every adapter into its base weight and return the plain model
    pub fn merge_and_unload(mut self) -> CausalLm {
        let merged = self
            .model
            .linears_mut()
            .into_iter()
            .filter(|(_, linear)| linear.lora().is_some())
            .map(|(_, linear)| linear.merge_lora())
            .filter(|m| *m)
            .count();
        tracing::debug!("merged {merged} adapters into the base weights");
        self.model
    }

    pub fn parameter_count(&self) -> ParameterCount {
        ParameterCount {
            trainable: self.model.num_trainable_parameters(),
            total: self.model.num_parameters(),
        }
    }

    pub fn print_trainable_parameters(&self) {
        tracing::info!("{}", self.parameter_count());
    }

    pub fn model(&self) -> &CausalLm {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut CausalLm {
        &mut self.model
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Full paths of the modules carrying an adapter
    pub fn adapted_modules(&self) -> &[String] {
        &self.adapted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::peft::ADAPTER_CONFIG_FILE;
    use crate::model::ModelConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn base() -> CausalLm {
        CausalLm::new_random(ModelConfig::new(10, 4, 6, 2), 11).unwrap()
    }

    fn config() -> LoraConfig {
        LoraConfig::new(2, 4.0).target_modules(&["up_proj", "down_proj"])
    }

    fn randomize_b(peft: &mut PeftModel) {
        for (_, linear) in peft.model_mut().linears_mut() {
            if let Some(lora) = linear.lora_mut() {
                let shape = lora.lora_b().shape();
                *lora.lora_b_mut().data_mut() =
                    Array2::from_shape_fn((shape[0], shape[1]), |(i, j)| (i as f32 - j as f32) * 0.05);
            }
        }
    }

    #[test]
    fn test_inject_targets() {
        let peft = PeftModel::inject(base(), config(), 0).unwrap();
        assert_eq!(
            peft.adapted_modules(),
            &[
                "model.layers.0.mlp.up_proj",
                "model.layers.0.mlp.down_proj",
                "model.layers.1.mlp.up_proj",
                "model.layers.1.mlp.down_proj"
            ]
        );
        let count = peft.parameter_count();
        assert!(count.trainable > 0 && count.trainable < count.total);
    }

    #[test]
    fn test_inject_without_matches_fails() {
        let cfg = LoraConfig::new(2, 4.0).target_modules(&["q_proj"]);
        assert!(matches!(
            PeftModel::inject(base(), cfg, 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_fresh_adapter_does_not_change_outputs() {
        let model = base();
        let ids = Array2::from_shape_vec((1, 3), vec![1, 2, 3]).unwrap();
        let before = model.forward(&ids).unwrap();
        let peft = PeftModel::inject(model, config(), 0).unwrap();
        assert_eq!(peft.model().forward(&ids).unwrap(), before);
    }

    #[test]
    fn test_save_and_reload_adapter() {
        let mut peft = PeftModel::inject(base(), config(), 0)
            .unwrap()
            .with_base_model_name("base");
        randomize_b(&mut peft);

        let dir = tempfile::tempdir().unwrap();
        peft.save_pretrained(dir.path()).unwrap();
        assert!(dir.path().join(ADAPTER_CONFIG_FILE).exists());

        let (tensors, _) = weights::load_file(dir.path().join(ADAPTER_WEIGHTS_FILE)).unwrap();
        assert!(tensors.contains_key("base_model.model.model.layers.0.mlp.up_proj.lora_A.weight"));
        assert_eq!(tensors.len(), 8);

        let reloaded = PeftModel::from_pretrained(base(), dir.path()).unwrap();
        assert_eq!(reloaded.adapted_modules(), peft.adapted_modules());
        let ids = Array2::from_shape_vec((1, 4), vec![4, 5, 6, 7]).unwrap();
        assert_eq!(
            reloaded.model().forward(&ids).unwrap(),
            peft.model().forward(&ids).unwrap()
        );
    }

    #[test]
    fn test_merge_and_unload_matches_adapted_forward() {
        let mut peft = PeftModel::inject(base(), config(), 3).unwrap();
        randomize_b(&mut peft);
        let ids = Array2::from_shape_vec((2, 3), vec![1, 2, 3, 9, 8, 7]).unwrap();
        let adapted = peft.model().forward(&ids).unwrap();

        let merged = peft.merge_and_unload();
        assert_eq!(merged.num_trainable_parameters(), 0);
        let out = merged.forward(&ids).unwrap();
        for (a, b) in adapted.iter().zip(out.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_adapter_for_unknown_module_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let peft = PeftModel::inject(base(), config(), 0).unwrap();
        peft.save_pretrained(dir.path()).unwrap();

        // Base with a single layer has no `model.layers.1.*`
        let small = CausalLm::new_random(ModelConfig::new(10, 4, 6, 1), 0).unwrap();
        assert!(PeftModel::from_pretrained(small, dir.path()).is_err());
    }

    #[test]
    fn test_parameter_count_display() {
        let count = ParameterCount {
            trainable: 25,
            total: 100,
        };
        assert_eq!(
            count.to_string(),
            "trainable params: 25 || all params: 100 || trainable%: 25.0000"
        );
    }
}
