//! Global gradient-norm clipping

use crate::Tensor;

/// Scale all gradients so their joint L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. Nothing is changed when `max_norm <= 0`.
pub fn clip_grad_norm(params: &mut [&mut Tensor], max_norm: f32) -> f32 {
    let total_norm_sq: f32 = params
        .iter()
        .filter_map(|p| p.grad())
        .map(|g| g.iter().map(|&v| v * v).sum::<f32>())
        .sum();
    let global_norm = total_norm_sq.sqrt();

    if max_norm > 0.0 && global_norm > max_norm {
        let clip_coef = max_norm / (global_norm + 1e-6);
        for param in params.iter_mut() {
            if let Some(grad) = param.grad() {
                let clipped = grad * clip_coef;
                param.set_grad(clipped);
            }
        }
    }

    global_norm
}
