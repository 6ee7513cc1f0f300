//! LoRA (Low-Rank Adaptation) adapter matrices
//!
//! For a frozen weight W ∈ ℝ^(d_out × d_in) the adapter adds
//! ΔW = scale · B·A with A ∈ ℝ^(r × d_in), B ∈ ℝ^(d_out × r) and
//! scale = alpha / r.
//!
//! Inputs are row-major batches X ∈ ℝ^(n × d_in), so the adapter branch is
//! `scale · drop(X)·Aᵀ·Bᵀ`.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;

use crate::{Error, Result, Tensor};

/// Trainable low-rank update attached to one linear module
#[derive(Debug, Clone)]
pub struct LoraLayer {
    /// Down-projection [r, d_in]
    lora_a: Tensor,
    /// Up-projection [d_out, r]
    lora_b: Tensor,
    rank: usize,
    alpha: f32,
    scale: f32,
    dropout: f32,
}

/// Activations kept from the forward pass for [`LoraLayer::backward`]
#[derive(Debug, Clone)]
pub struct LoraCache {
    /// Input after dropout [n, d_in]
    input: Array2<f32>,
    /// Dropout mask with the 1/(1-p) factor folded in
    mask: Option<Array2<f32>>,
    /// drop(X)·Aᵀ [n, r]
    hidden: Array2<f32>,
}

impl LoraLayer {
    /// Fresh adapter: A uniform in ±1/√d_in, B zeros, so ΔW starts at 0
    pub fn new(
        d_out: usize,
        d_in: usize,
        rank: usize,
        alpha: f32,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Self {
        let bound = 1.0 / (d_in as f32).sqrt();
        let a = Array2::from_shape_fn((rank, d_in), |_| rng.random_range(-bound..bound));
        Self {
            lora_a: Tensor::new(a, true),
            lora_b: Tensor::zeros(d_out, rank, true),
            rank,
            alpha,
            scale: alpha / rank as f32,
            dropout,
        }
    }

    /// Adapter from saved matrices
    pub fn from_weights(
        lora_a: Array2<f32>,
        lora_b: Array2<f32>,
        alpha: f32,
        dropout: f32,
    ) -> Result<Self> {
        let rank = lora_a.nrows();
        if lora_b.ncols() != rank || rank == 0 {
            return Err(Error::ShapeMismatch {
                expected: vec![lora_b.nrows(), rank],
                got: vec![lora_b.nrows(), lora_b.ncols()],
            });
        }
        Ok(Self {
            lora_a: Tensor::new(lora_a, true),
            lora_b: Tensor::new(lora_b, true),
            rank,
            alpha,
            scale: alpha / rank as f32,
            dropout,
        })
    }

    /// scale · B·A, shaped like the base weight
    pub fn delta_weight(&self) -> Array2<f32> {
        self.lora_b.data().dot(self.lora_a.data()) * self.scale
    }

    /// Adapter branch output [n, d_out]. Dropout is only applied when an rng
    /// is supplied (training).
    pub fn forward(&self, x: &Array2<f32>, rng: Option<&mut StdRng>) -> (Array2<f32>, LoraCache) {
        let (input, mask) = match rng {
            Some(rng) if self.dropout > 0.0 => {
                let keep = 1.0 / (1.0 - self.dropout);
                let p = self.dropout;
                let mask = Array2::from_shape_fn(x.dim(), |_| {
                    if rng.random::<f32>() < p {
                        0.0
                    } else {
                        keep
                    }
                });
                (x * &mask, Some(mask))
            }
            _ => (x.clone(), None),
        };

        let hidden = input.dot(&self.lora_a.data().t());
        let out = hidden.dot(&self.lora_b.data().t()) * self.scale;
        (out, LoraCache { input, mask, hidden })
    }

    /// Accumulate dA, dB and return the gradient w.r.t. the branch input
    pub fn backward(&mut self, cache: &LoraCache, grad_out: &Array2<f32>) -> Array2<f32> {
        // dB = s·dYᵀ·Z, dZ = s·dY·B
        let grad_b = grad_out.t().dot(&cache.hidden) * self.scale;
        let grad_hidden = grad_out.dot(self.lora_b.data()) * self.scale;
        let grad_a = grad_hidden.t().dot(&cache.input);
        let mut grad_input = grad_hidden.dot(self.lora_a.data());
        if let Some(mask) = &cache.mask {
            grad_input *= mask;
        }

        self.lora_a.accumulate_grad(grad_a);
        self.lora_b.accumulate_grad(grad_b);
        grad_input
    }

    pub fn lora_a(&self) -> &Tensor {
        &self.lora_a
    }

    pub fn lora_a_mut(&mut self) -> &mut Tensor {
        &mut self.lora_a
    }

    pub fn lora_b(&self) -> &Tensor {
        &self.lora_b
    }

    pub fn lora_b_mut(&mut self) -> &mut Tensor {
        &mut self.lora_b
    }

    /// Trainable parameters (A and B)
    pub fn trainable_params(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.lora_a, &mut self.lora_b]
    }

    pub fn num_parameters(&self) -> usize {
        self.lora_a.len() + self.lora_b.len()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// alpha / rank
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn dropout(&self) -> f32 {
        self.dropout
    }

    pub fn d_in(&self) -> usize {
        self.lora_a.shape()[1]
    }

    pub fn d_out(&self) -> usize {
        self.lora_b.shape()[0]
    }
}
