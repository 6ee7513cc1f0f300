//! AdamW optimizer (Adam with decoupled Weight decay)

use ndarray::Array2;

use super::Optimizer;
use crate::Tensor;

/// AdamW optimizer
///
/// AdamW: θ_t = (1 - lr * λ) * θ_{t-1} - lr * m̂_t / (√v̂_t + ε)
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    m: Vec<Option<Array2<f32>>>, // First moment
    v: Vec<Option<Array2<f32>>>, // Second moment
}

impl AdamW {
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// AdamW with default betas and weight_decay = 0.01
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.01)
    }

    /// Optimizer steps taken so far
    pub fn step_count(&self) -> u64 {
        self.t
    }

    fn ensure_moments(&mut self, n: usize) {
        if self.m.len() != n {
            self.m = vec![None; n];
            self.v = vec![None; n];
        }
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [&mut Tensor]) {
        self.ensure_moments(params.len());
        self.t += 1;

        // Bias correction folded into the step size
        let lr_t = self.lr
            * ((1.0 - self.beta2.powi(self.t as i32)).sqrt()
                / (1.0 - self.beta1.powi(self.t as i32)));
        let decay = 1.0 - self.lr * self.weight_decay;

        for (i, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad() else {
                continue;
            };

            let m_t = match &self.m[i] {
                Some(m) => m * self.beta1 + grad * (1.0 - self.beta1),
                None => grad * (1.0 - self.beta1),
            };
            let grad_sq = grad * grad;
            let v_t = match &self.v[i] {
                Some(v) => v * self.beta2 + &grad_sq * (1.0 - self.beta2),
                None => &grad_sq * (1.0 - self.beta2),
            };

            let update = &m_t / &(v_t.mapv(f32::sqrt) + self.epsilon) * lr_t;
            let data = param.data_mut();
            *data *= decay;
            *data -= &update;

            self.m[i] = Some(m_t);
            self.v[i] = Some(v_t);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_adamw_quadratic_convergence() {
        // f(x) = x², ∇ = 2x
        let mut p = Tensor::new(array![[5.0, -3.0, 2.0]], true);
        let mut optimizer = AdamW::default_params(0.1);

        for _ in 0..100 {
            let grad = p.data().mapv(|x| 2.0 * x);
            p.set_grad(grad);
            optimizer.step(&mut [&mut p]);
        }

        for &val in p.data().iter() {
            assert!(val.abs() < 0.5, "Value {} did not converge", val);
        }
    }

    #[test]
    fn test_adamw_weight_decay_only() {
        let mut p = Tensor::new(array![[1.0]], true);
        let mut optimizer = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.1);
        p.set_grad(array![[0.0]]);
        optimizer.step(&mut [&mut p]);
        // θ = (1 - 0.1·0.1)·1
        assert_abs_diff_eq!(p.data()[[0, 0]], 0.99, epsilon = 1e-6);
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // With bias correction the first update is lr·sign(g)
        let mut p = Tensor::new(array![[0.0, 0.0]], true);
        let mut optimizer = AdamW::new(0.01, 0.9, 0.999, 1e-8, 0.0);
        p.set_grad(array![[3.0, -0.5]]);
        optimizer.step(&mut [&mut p]);
        assert_abs_diff_eq!(p.data()[[0, 0]], -0.01, epsilon = 1e-5);
        assert_abs_diff_eq!(p.data()[[0, 1]], 0.01, epsilon = 1e-5);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn test_params_without_grad_skipped() {
        let mut a = Tensor::new(array![[1.0]], true);
        let mut b = Tensor::new(array![[1.0]], true);
        b.set_grad(array![[1.0]]);
        let mut optimizer = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.0);
        optimizer.step(&mut [&mut a, &mut b]);
        assert_eq!(a.data()[[0, 0]], 1.0);
        assert!(b.data()[[0, 0]] < 1.0);
    }

    #[test]
    fn test_zero_grad_clears_all() {
        let mut a = Tensor::new(array![[1.0]], true);
        a.set_grad(array![[1.0]]);
        let mut optimizer = AdamW::default_params(0.1);
        optimizer.zero_grad(&mut [&mut a]);
        assert!(a.grad().is_none());
    }
}
