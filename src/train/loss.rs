//! Next-token cross-entropy for causal language modelling

use ndarray::{Array2, ArrayView1};

use crate::data::IGNORE_INDEX;
use crate::{Error, Result};

/// Mean loss over the supervised positions of a batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossOutput {
    pub loss: f32,
    /// Positions that contributed to `loss`
    pub num_tokens: usize,
}

/// Shifted cross-entropy: `logits[b, t]` predicts `labels[b, t + 1]`.
///
/// `logits` is `[batch * seq_len, vocab]` (row `b * seq_len + t`). Positions
/// whose label is [`IGNORE_INDEX`] or whose attention mask is 0 are skipped.
/// Returns the loss and dL/dlogits.
pub fn shifted_cross_entropy(
    logits: &Array2<f32>,
    labels: &Array2<i64>,
    attention_mask: &Array2<u8>,
) -> Result<(LossOutput, Array2<f32>)> {
    let (batch, seq_len) = labels.dim();
    let vocab = logits.ncols();
    if logits.nrows() != batch * seq_len {
        return Err(Error::ShapeMismatch {
            expected: vec![batch * seq_len, vocab],
            got: vec![logits.nrows(), vocab],
        });
    }

    let mut targets = Vec::new();
    for b in 0..batch {
        for t in 0..seq_len.saturating_sub(1) {
            let label = labels[[b, t + 1]];
            if label == IGNORE_INDEX || attention_mask[[b, t + 1]] == 0 {
                continue;
            }
            let target = usize::try_from(label)
                .ok()
                .filter(|&l| l < vocab)
                .ok_or_else(|| Error::Model(format!("label {label} outside vocabulary of {vocab}")))?;
            targets.push((b * seq_len + t, target));
        }
    }

    let mut grad = Array2::zeros(logits.dim());
    if targets.is_empty() {
        return Ok((
            LossOutput {
                loss: 0.0,
                num_tokens: 0,
            },
            grad,
        ));
    }

    let n = targets.len() as f32;
    let mut total = 0.0f32;
    for &(row, target) in &targets {
        let probs = softmax(logits.row(row));
        total -= probs[target].max(f32::MIN_POSITIVE).ln();
        let mut g = grad.row_mut(row);
        for (j, p) in probs.iter().enumerate() {
            g[j] = p / n;
        }
        g[target] -= 1.0 / n;
    }

    Ok((
        LossOutput {
            loss: total / n,
            num_tokens: targets.len(),
        },
        grad,
    ))
}

/// Numerically stable softmax
pub fn softmax(x: ArrayView1<'_, f32>) -> Vec<f32> {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = x.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}
