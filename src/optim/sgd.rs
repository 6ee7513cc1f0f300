//! Stochastic Gradient Descent optimizer

use ndarray::Array2;

use super::Optimizer;
use crate::Tensor;

/// SGD with optional momentum and L2 weight decay
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocities: Vec<Option<Array2<f32>>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocities: Vec::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Tensor]) {
        if self.velocities.len() != params.len() {
            self.velocities = vec![None; params.len()];
        }

        for (i, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad() else {
                continue;
            };
            let grad = if self.weight_decay > 0.0 {
                grad + &(param.data() * self.weight_decay)
            } else {
                grad.clone()
            };

            if self.momentum > 0.0 {
                // v = momentum * v - lr * grad
                let velocity = match &self.velocities[i] {
                    Some(v) => v * self.momentum - &grad * self.lr,
                    None => &grad * (-self.lr),
                };
                *param.data_mut() += &velocity;
                self.velocities[i] = Some(velocity);
            } else {
                *param.data_mut() -= &(&grad * self.lr);
            }
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
