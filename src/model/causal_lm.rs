//! Small causal language model with LoRA-capable linear modules
//!
//! Architecture:
//!
//! ```text
//! h₀[t]  = E[x_t] + mean(E[x_0..=t])            causal context
//! hₗ₊₁   = hₗ + down_proj(gelu(up_proj(hₗ)))     residual MLP blocks
//! logits = lm_head(h_L)
//! ```
//!
//! Weight names follow the HuggingFace layout
//! (`model.layers.{i}.mlp.up_proj.weight`, ...). Embeddings and base weights
//! are frozen; only attached LoRA matrices receive gradients.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::ModelConfig;
use super::device::DevicePlacement;
use super::linear::Linear;
use super::weights::{self, StateDict, WeightDtype, WEIGHTS_FILE};
use crate::data::Batch;
use crate::lora::LoraCache;
use crate::train::loss::{shifted_cross_entropy, softmax, LossOutput};
use crate::{Error, Result, Tensor};

pub const EMBED_TOKENS: &str = "model.embed_tokens";
pub const LM_HEAD: &str = "lm_head";

/// Kind of a named submodule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Embedding,
    Linear,
    /// 4-bit quantized linear (never produced by the native loader)
    Linear4bit,
    Activation,
}

#[derive(Debug, Clone)]
struct MlpBlock {
    up_proj: Linear,
    down_proj: Linear,
}

struct BlockCache {
    up: Option<LoraCache>,
    pre_activation: Array2<f32>,
    down: Option<LoraCache>,
}

struct ForwardCache {
    blocks: Vec<BlockCache>,
    head: Option<LoraCache>,
}

/// Causal LM loaded from (or saved to) a HuggingFace-style directory
#[derive(Debug, Clone)]
pub struct CausalLm {
    config: ModelConfig,
    embed_tokens: Tensor,
    layers: Vec<MlpBlock>,
    lm_head: Linear,
    dtype: WeightDtype,
    placement: DevicePlacement,
}

impl CausalLm {
    /// Randomly initialised model (fixtures and from-scratch experiments)
    pub fn new_random(config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let (v, h, i) = (
            config.vocab_size,
            config.hidden_size,
            config.intermediate_size,
        );
        let mut uniform = |rows: usize, cols: usize, bound: f32| {
            Array2::from_shape_fn((rows, cols), |_| rng.random_range(-bound..bound))
        };

        let embed = uniform(v, h, 1.0);
        let layers = (0..config.num_hidden_layers)
            .map(|_| MlpBlock {
                up_proj: Linear::new(uniform(i, h, 1.0 / (h as f32).sqrt())),
                down_proj: Linear::new(uniform(h, i, 1.0 / (i as f32).sqrt())),
            })
            .collect();
        let lm_head = Linear::new(uniform(v, h, 1.0 / (h as f32).sqrt()));

        Ok(Self {
            config,
            embed_tokens: Tensor::new(embed, false),
            layers,
            lm_head,
            dtype: WeightDtype::F32,
            placement: DevicePlacement::Cpu,
        })
    }

    /// Build from named weights, checking every shape against `config`
    pub fn from_state_dict(
        config: ModelConfig,
        mut state: StateDict,
        dtype: WeightDtype,
    ) -> Result<Self> {
        config.validate()?;
        let (v, h, i) = (
            config.vocab_size,
            config.hidden_size,
            config.intermediate_size,
        );

        let embed = take_weight(&mut state, EMBED_TOKENS, [v, h])?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for l in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{l}.mlp");
            layers.push(MlpBlock {
                up_proj: Linear::new(take_weight(&mut state, &format!("{prefix}.up_proj"), [i, h])?),
                down_proj: Linear::new(take_weight(
                    &mut state,
                    &format!("{prefix}.down_proj"),
                    [h, i],
                )?),
            });
        }

        let lm_head = if state.contains_key(&format!("{LM_HEAD}.weight")) {
            take_weight(&mut state, LM_HEAD, [v, h])?
        } else if config
            .extra
            .get("tie_word_embeddings")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            embed.clone()
        } else {
            return Err(Error::MissingTensor(format!("{LM_HEAD}.weight")));
        };

        if !state.is_empty() {
            let unused: Vec<&String> = state.keys().collect();
            tracing::warn!("ignoring {} unexpected tensors: {:?}", unused.len(), unused);
        }

        Ok(Self {
            config,
            embed_tokens: Tensor::new(embed, false),
            layers,
            lm_head: Linear::new(lm_head),
            dtype,
            placement: DevicePlacement::Cpu,
        })
    }

    /// Load `config.json` plus safetensors weights, keeping the stored dtype
    pub fn from_pretrained(dir: impl AsRef<Path>, placement: DevicePlacement) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::NotFound(dir.to_path_buf()));
        }
        let config = ModelConfig::load(dir)?;
        let (state, dtype) = weights::load_dir(dir)?;
        tracing::debug!(
            "loading model from {} ({} tensors, {:?}, placement {placement})",
            dir.display(),
            state.len(),
            dtype
        );
        let mut model = Self::from_state_dict(config, state, dtype)?;
        model.placement = placement;
        Ok(model)
    }

    /// Write `config.json` and `model.safetensors` in the model's dtype
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut config = self.config.clone();
        config.torch_dtype = Some(self.dtype.as_torch_str().to_string());
        config.save(dir)?;

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        weights::save_file(dir.join(WEIGHTS_FILE), &self.state_dict(), self.dtype, Some(metadata))
    }

    /// Base weights by name. Attached adapters are not included.
    pub fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            format!("{EMBED_TOKENS}.weight"),
            self.embed_tokens.data().clone(),
        );
        for (name, linear) in self.linears() {
            state.insert(format!("{name}.weight"), linear.weight().clone());
        }
        state
    }

    /// Every submodule with its kind, in definition order
    pub fn named_modules(&self) -> Vec<(String, ModuleKind)> {
        let mut modules = vec![(EMBED_TOKENS.to_string(), ModuleKind::Embedding)];
        for l in 0..self.layers.len() {
            let prefix = format!("model.layers.{l}.mlp");
            modules.push((format!("{prefix}.up_proj"), ModuleKind::Linear));
            modules.push((format!("{prefix}.act_fn"), ModuleKind::Activation));
            modules.push((format!("{prefix}.down_proj"), ModuleKind::Linear));
        }
        modules.push((LM_HEAD.to_string(), ModuleKind::Linear));
        modules
    }

    /// Linear modules by name, in definition order
    pub fn linears(&self) -> Vec<(String, &Linear)> {
        let mut out = Vec::with_capacity(self.layers.len() * 2 + 1);
        for (l, block) in self.layers.iter().enumerate() {
            out.push((format!("model.layers.{l}.mlp.up_proj"), &block.up_proj));
            out.push((format!("model.layers.{l}.mlp.down_proj"), &block.down_proj));
        }
        out.push((LM_HEAD.to_string(), &self.lm_head));
        out
    }

    pub fn linears_mut(&mut self) -> Vec<(String, &mut Linear)> {
        let mut out = Vec::with_capacity(self.layers.len() * 2 + 1);
        for (l, block) in self.layers.iter_mut().enumerate() {
            out.push((format!("model.layers.{l}.mlp.up_proj"), &mut block.up_proj));
            out.push((format!("model.layers.{l}.mlp.down_proj"), &mut block.down_proj));
        }
        out.push((LM_HEAD.to_string(), &mut self.lm_head));
        out
    }

    pub fn linear_mut(&mut self, name: &str) -> Option<&mut Linear> {
        self.linears_mut()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, linear)| linear)
    }

    /// LoRA matrices in module order (A then B per module)
    pub fn trainable_params(&mut self) -> Vec<&mut Tensor> {
        self.linears_mut()
            .into_iter()
            .filter_map(|(_, linear)| linear.lora_mut())
            .flat_map(|lora| lora.trainable_params())
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.embed_tokens.len()
            + self
                .linears()
                .iter()
                .map(|(_, l)| l.num_parameters())
                .sum::<usize>()
    }

    pub fn num_trainable_parameters(&self) -> usize {
        self.linears()
            .iter()
            .filter_map(|(_, l)| l.lora())
            .map(|lora| lora.num_parameters())
            .sum()
    }

    pub fn zero_grad(&mut self) {
        for p in self.trainable_params() {
            p.zero_grad();
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn dtype(&self) -> WeightDtype {
        self.dtype
    }

    pub fn set_dtype(&mut self, dtype: WeightDtype) {
        self.dtype = dtype;
    }

    pub fn placement(&self) -> DevicePlacement {
        self.placement
    }

    /// Logits for every position, `[batch * seq_len, vocab]`
    pub fn forward(&self, input_ids: &Array2<u32>) -> Result<Array2<f32>> {
        let (logits, _) = self.forward_impl(input_ids, None)?;
        Ok(logits)
    }

    /// Loss without gradients
    pub fn compute_loss(&self, batch: &Batch) -> Result<LossOutput> {
        let logits = self.forward(&batch.input_ids)?;
        let (out, _) = shifted_cross_entropy(&logits, &batch.labels, &batch.attention_mask)?;
        Ok(out)
    }

    /// Forward + backward; adapter gradients are accumulated into their
    /// tensors. Passing an rng enables LoRA dropout.
    pub fn loss_and_backward(
        &mut self,
        batch: &Batch,
        rng: Option<&mut StdRng>,
    ) -> Result<LossOutput> {
        let (logits, cache) = self.forward_impl(&batch.input_ids, rng)?;
        let (out, grad_logits) =
            shifted_cross_entropy(&logits, &batch.labels, &batch.attention_mask)?;
        if out.num_tokens > 0 {
            self.backward(cache, &grad_logits);
        }
        Ok(out)
    }

    /// Greedy decoding. Returns prompt ++ generated ids; stops after emitting
    /// any id in `eos_ids`.
    pub fn generate(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        eos_ids: &[u32],
    ) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            return Err(Error::Model("cannot generate from an empty prompt".into()));
        }
        let mut sequence = prompt.to_vec();
        let mut sum = Array1::<f32>::zeros(self.config.hidden_size);
        for &id in prompt {
            sum += &self.embedding(id)?;
        }

        for _ in 0..max_new_tokens {
            let last = *sequence.last().unwrap_or(&prompt[0]);
            let context = self.embedding(last)? + &(&sum / sequence.len() as f32);
            let logits = self.head(context.insert_axis(Axis(0)))?;
            let probs = softmax(logits.row(0));
            let next = argmax(&probs) as u32;

            sequence.push(next);
            if eos_ids.contains(&next) {
                break;
            }
            sum += &self.embedding(next)?;
        }
        Ok(sequence)
    }

    fn embedding(&self, id: u32) -> Result<Array1<f32>> {
        let idx = id as usize;
        if idx >= self.config.vocab_size {
            return Err(Error::Model(format!(
                "token id {id} outside vocabulary of {}",
                self.config.vocab_size
            )));
        }
        Ok(self.embed_tokens.data().row(idx).to_owned())
    }

    /// Run blocks + lm_head on a `[n, hidden]` batch of context vectors
    fn head(&self, mut hidden: Array2<f32>) -> Result<Array2<f32>> {
        for block in &self.layers {
            let (pre, _) = block.up_proj.forward(&hidden, None);
            let (down, _) = block.down_proj.forward(&pre.mapv(gelu), None);
            hidden += &down;
        }
        Ok(self.lm_head.forward(&hidden, None).0)
    }

    /// Causal context vectors for every row, flattened to `[batch * seq, hidden]`
    fn context(&self, input_ids: &Array2<u32>) -> Result<Array2<f32>> {
        let (batch, seq_len) = input_ids.dim();
        let hidden_size = self.config.hidden_size;
        let mut out = Array2::zeros((batch * seq_len, hidden_size));
        for (b, row) in input_ids.axis_iter(Axis(0)).enumerate() {
            let mut sum = Array1::<f32>::zeros(hidden_size);
            for (t, &id) in row.iter().enumerate() {
                let e = self.embedding(id)?;
                sum += &e;
                let ctx = e + &(&sum / (t + 1) as f32);
                out.row_mut(b * seq_len + t).assign(&ctx);
            }
        }
        Ok(out)
    }

    fn forward_impl(
        &self,
        input_ids: &Array2<u32>,
        mut rng: Option<&mut StdRng>,
    ) -> Result<(Array2<f32>, ForwardCache)> {
        let mut hidden = self.context(input_ids)?;
        let mut blocks = Vec::with_capacity(self.layers.len());
        for block in &self.layers {
            let (pre_activation, up) = block.up_proj.forward(&hidden, rng.as_deref_mut());
            let activated = pre_activation.mapv(gelu);
            let (down_out, down) = block.down_proj.forward(&activated, rng.as_deref_mut());
            hidden += &down_out;
            blocks.push(BlockCache {
                up,
                pre_activation,
                down,
            });
        }
        let (logits, head) = self.lm_head.forward(&hidden, rng.as_deref_mut());
        Ok((logits, ForwardCache { blocks, head }))
    }

    fn backward(&mut self, cache: ForwardCache, grad_logits: &Array2<f32>) {
        let mut grad_hidden = self.lm_head.backward(cache.head.as_ref(), grad_logits);
        for (block, block_cache) in self.layers.iter_mut().zip(cache.blocks.iter()).rev() {
            let grad_activated = block
                .down_proj
                .backward(block_cache.down.as_ref(), &grad_hidden);
            let grad_pre = grad_activated * &block_cache.pre_activation.mapv(gelu_grad);
            let grad_branch = block.up_proj.backward(block_cache.up.as_ref(), &grad_pre);
            grad_hidden += &grad_branch;
        }
    }
}

fn take_weight(state: &mut StateDict, module: &str, shape: [usize; 2]) -> Result<Array2<f32>> {
    let name = format!("{module}.weight");
    let weight = state
        .remove(&name)
        .ok_or_else(|| Error::MissingTensor(name.clone()))?;
    let (r, c) = weight.dim();
    if [r, c] != shape {
        return Err(Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![r, c],
        });
    }
    Ok(weight)
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF: f32 = 0.044_715;

/// tanh approximation of GELU
fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x)).tanh())
}

fn gelu_grad(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x);
    let t = inner.tanh();
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEF * x * x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{PaddingCollator, TokenizedExample};
    use crate::lora::LoraLayer;
    use approx::assert_abs_diff_eq;

    fn tiny() -> CausalLm {
        CausalLm::new_random(ModelConfig::new(11, 6, 8, 2).with_eos_token_id(1), 3).unwrap()
    }

    fn batch() -> Batch {
        let a = TokenizedExample {
            input_ids: vec![3, 4, 5, 6, 1],
            attention_mask: vec![1; 5],
            labels: vec![-100, -100, 5, 6, 1],
        };
        let b = TokenizedExample {
            input_ids: vec![7, 8, 1],
            attention_mask: vec![1; 3],
            labels: vec![-100, 8, 1],
        };
        PaddingCollator::new(0).collate(&[&a, &b])
    }

    fn attach_all(model: &mut CausalLm, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for (name, linear) in model.linears_mut() {
            if name == LM_HEAD {
                continue;
            }
            let (out_f, in_f) = (linear.out_features(), linear.in_features());
            let mut lora = LoraLayer::new(out_f, in_f, 2, 4.0, 0.0, &mut rng);
            // Non-zero B so every gradient path is exercised
            *lora.lora_b_mut().data_mut() =
                Array2::from_shape_fn((out_f, 2), |(i, j)| ((i + j) as f32 * 0.37).sin() * 0.1);
            linear.attach_lora(lora).unwrap();
        }
    }

    fn nudged(model: &CausalLm, param: usize, at: (usize, usize), delta: f32) -> CausalLm {
        let mut copy = model.clone();
        if let Some(p) = copy.trainable_params().into_iter().nth(param) {
            p.data_mut()[[at.0, at.1]] += delta;
        }
        copy
    }

    #[test]
    fn test_named_modules_layout() {
        let names: Vec<(String, ModuleKind)> = tiny().named_modules();
        assert_eq!(names[0], (EMBED_TOKENS.to_string(), ModuleKind::Embedding));
        assert_eq!(
            names[1],
            ("model.layers.0.mlp.up_proj".to_string(), ModuleKind::Linear)
        );
        assert_eq!(names.last().unwrap().0, LM_HEAD);
        assert_eq!(names.len(), 1 + 2 * 3 + 1);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let model = tiny();
        let dir = tempfile::tempdir().unwrap();
        model.save_pretrained(dir.path()).unwrap();
        let loaded = CausalLm::from_pretrained(dir.path(), DevicePlacement::Cpu).unwrap();
        assert_eq!(loaded.state_dict(), model.state_dict());
        assert_eq!(loaded.config().eos_token_id, model.config().eos_token_id);
        assert_eq!(
            loaded.config().torch_dtype.as_deref(),
            Some(WeightDtype::F32.as_torch_str())
        );
    }

    #[test]
    fn test_missing_lm_head() {
        let model = tiny();
        let mut state = model.state_dict();
        state.remove("lm_head.weight");
        let err = CausalLm::from_state_dict(model.config().clone(), state, WeightDtype::F32)
            .unwrap_err();
        assert!(matches!(err, Error::MissingTensor(_)));
    }

    #[test]
    fn test_tied_embeddings() {
        let model = tiny();
        let mut state = model.state_dict();
        state.remove("lm_head.weight");
        let mut config = model.config().clone();
        config
            .extra
            .insert("tie_word_embeddings".into(), serde_json::Value::Bool(true));
        let tied = CausalLm::from_state_dict(config, state, WeightDtype::F32).unwrap();
        assert_eq!(
            tied.state_dict()["lm_head.weight"],
            tied.state_dict()["model.embed_tokens.weight"]
        );
    }

    #[test]
    fn test_wrong_shape_rejected() {
        let model = tiny();
        let mut state = model.state_dict();
        state.insert("model.layers.0.mlp.up_proj.weight".into(), Array2::zeros((2, 2)));
        let err = CausalLm::from_state_dict(model.config().clone(), state, WeightDtype::F32)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_out_of_vocab_id() {
        let model = tiny();
        assert!(model.forward(&Array2::from_elem((1, 2), 99)).is_err());
    }

    #[test]
    fn test_generate_matches_full_forward() {
        let model = tiny();
        let prompt = [3u32, 4, 5];
        let out = model.generate(&prompt, 4, &[]).unwrap();
        assert_eq!(out.len(), 7);
        assert_eq!(&out[..3], &prompt);

        // Each generated token is the argmax of the full-sequence forward
        for step in 3..out.len() {
            let ids = Array2::from_shape_vec((1, step), out[..step].to_vec()).unwrap();
            let logits = model.forward(&ids).unwrap();
            let expected = argmax(&logits.row(step - 1).to_vec());
            assert_eq!(out[step] as usize, expected);
        }
    }

    #[test]
    fn test_generate_stops_at_eos() {
        let model = tiny();
        let first = model.generate(&[3], 1, &[]).unwrap()[1];
        let out = model.generate(&[3], 10, &[first]).unwrap();
        assert_eq!(out, vec![3, first]);
    }

    #[test]
    fn test_generate_empty_prompt() {
        assert!(tiny().generate(&[], 3, &[]).is_err());
    }

    #[test]
    fn test_only_adapters_are_trainable() {
        let mut model = tiny();
        assert_eq!(model.num_trainable_parameters(), 0);
        attach_all(&mut model, 1);
        // 2 layers × (up 2·6 + 8·2, down 2·8 + 6·2)
        assert_eq!(model.num_trainable_parameters(), 2 * ((12 + 16) + (16 + 12)));
        assert_eq!(model.trainable_params().len(), 8);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut model = tiny();
        attach_all(&mut model, 5);
        let batch = batch();

        model.zero_grad();
        model.loss_and_backward(&batch, None).unwrap();
        let analytic: Vec<Array2<f32>> = model
            .trainable_params()
            .iter()
            .map(|p| p.grad().unwrap().clone())
            .collect();

        let eps = 1e-2;
        for (p_idx, grad) in analytic.iter().enumerate() {
            // Probe a few entries of each matrix
            for &(i, j) in &[(0usize, 0usize), (1, 1)] {
                if i >= grad.nrows() || j >= grad.ncols() {
                    continue;
                }
                let plus = nudged(&model, p_idx, (i, j), eps);
                let minus = nudged(&model, p_idx, (i, j), -eps);
                let numeric = (plus.compute_loss(&batch).unwrap().loss
                    - minus.compute_loss(&batch).unwrap().loss)
                    / (2.0 * eps);
                assert_abs_diff_eq!(grad[[i, j]], numeric, epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn test_base_weights_untouched_by_backward() {
        let mut model = tiny();
        attach_all(&mut model, 2);
        let before = model.state_dict();
        model.loss_and_backward(&batch(), None).unwrap();
        assert_eq!(model.state_dict(), before);
    }

    #[test]
    fn test_gelu_grad_matches_numeric() {
        for &x in &[-2.0f32, -0.5, 0.0, 0.7, 3.0] {
            let eps = 1e-3;
            let numeric = (gelu(x + eps) - gelu(x - eps)) / (2.0 * eps);
            assert_abs_diff_eq!(gelu_grad(x), numeric, epsilon = 1e-3);
        }
    }
}
