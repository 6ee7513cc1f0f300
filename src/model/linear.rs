//! Bias-free linear module with an optional LoRA branch

use ndarray::Array2;
use rand::rngs::StdRng;

use crate::lora::{LoraCache, LoraLayer};
use crate::{Error, Result, Tensor};

/// `y = x·Wᵀ (+ scale·drop(x)·Aᵀ·Bᵀ)` with W frozen
#[derive(Debug, Clone)]
pub struct Linear {
    /// [out_features, in_features]
    weight: Tensor,
    lora: Option<LoraLayer>,
}

impl Linear {
    pub fn new(weight: Array2<f32>) -> Self {
        Self {
            weight: Tensor::new(weight, false),
            lora: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn weight(&self) -> &Array2<f32> {
        self.weight.data()
    }

    /// Forward pass; returns the adapter activations needed for backward
    pub fn forward(
        &self,
        x: &Array2<f32>,
        rng: Option<&mut StdRng>,
    ) -> (Array2<f32>, Option<LoraCache>) {
        let mut y = x.dot(&self.weight.data().t());
        match &self.lora {
            Some(lora) => {
                let (delta, cache) = lora.forward(x, rng);
                y += &delta;
                (y, Some(cache))
            }
            None => (y, None),
        }
    }

    /// Gradient w.r.t. the input; adapter gradients are accumulated in place
    pub fn backward(&mut self, cache: Option<&LoraCache>, grad_out: &Array2<f32>) -> Array2<f32> {
        let mut grad_in = grad_out.dot(self.weight.data());
        if let (Some(lora), Some(cache)) = (self.lora.as_mut(), cache) {
            grad_in += &lora.backward(cache, grad_out);
        }
        grad_in
    }

    /// Attach an adapter whose shape matches this module
    pub fn attach_lora(&mut self, lora: LoraLayer) -> Result<()> {
        if lora.d_in() != self.in_features() || lora.d_out() != self.out_features() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.out_features(), self.in_features()],
                got: vec![lora.d_out(), lora.d_in()],
            });
        }
        self.lora = Some(lora);
        Ok(())
    }

    pub fn lora(&self) -> Option<&LoraLayer> {
        self.lora.as_ref()
    }

    pub fn lora_mut(&mut self) -> Option<&mut LoraLayer> {
        self.lora.as_mut()
    }

    /// Fold the adapter into W and drop it: W' = W + scale·B·A
    pub fn merge_lora(&mut self) -> bool {
        match self.lora.take() {
            Some(lora) => {
                *self.weight.data_mut() += &lora.delta_weight();
                true
            }
            None => false,
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.lora.as_ref().map_or(0, LoraLayer::num_parameters)
    }
}
