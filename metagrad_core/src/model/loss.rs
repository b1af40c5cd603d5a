//! Loss functions and accuracy on flattened `[batch, outputs]` logits.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFn {
    /// Softmax over the output axis followed by cross-entropy against
    /// one-hot (or soft) targets
    #[default]
    SoftmaxCrossEntropy,
    /// Mean over every element of `(prediction - target)^2`
    MeanSquaredError,
}

impl LossFn {
    /// Scalar loss averaged over the batch and its gradient w.r.t. `logits`.
    pub fn compute(
        &self,
        logits: &Array2<f32>,
        targets: &Array2<f32>,
    ) -> MetaResult<(f32, Array2<f32>)> {
        if logits.dim() != targets.dim() {
            return Err(MetaError::shape("loss targets", logits.shape(), targets.shape()));
        }
        let batch = logits.nrows().max(1) as f32;

        match self {
            LossFn::SoftmaxCrossEntropy => {
                let probs = softmax(logits);
                let mut loss = 0.0;
                for (p_row, t_row) in probs.outer_iter().zip(targets.outer_iter()) {
                    for (&p, &t) in p_row.iter().zip(t_row.iter()) {
                        if t != 0.0 {
                            loss -= t * p.max(f32::MIN_POSITIVE).ln();
                        }
                    }
                }
                let grad = (&probs - targets) / batch;
                Ok((loss / batch, grad))
            }
            LossFn::MeanSquaredError => {
                let diff = logits - targets;
                let count = diff.len().max(1) as f32;
                let loss = diff.mapv(|d| d * d).sum() / count;
                Ok((loss, diff * (2.0 / count)))
            }
        }
    }
}

/// Row-wise softmax with max subtraction.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|x| x / sum);
        }
    }
    probs
}

/// Index of the largest logit per row; ties resolve to the first index.
pub fn argmax_rows(logits: ArrayView2<'_, f32>) -> Vec<usize> {
    logits
        .outer_iter()
        .map(|row| {
            let mut best = 0;
            for (i, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = i;
                }
            }
            best
        })
        .collect()
}

/// Fraction of rows whose argmax equals the label.
///
/// An empty batch scores `0.0`.
pub fn compute_accuracy(
    labels: ArrayView1<'_, usize>,
    logits: ArrayView2<'_, f32>,
) -> MetaResult<f32> {
    if labels.len() != logits.nrows() {
        return Err(MetaError::shape(
            "accuracy labels",
            &[logits.nrows()],
            &[labels.len()],
        ));
    }
    if labels.is_empty() {
        return Ok(0.0);
    }
    let correct = argmax_rows(logits)
        .into_iter()
        .zip(labels.iter())
        .filter(|(pred, label)| pred == *label)
        .count();
    Ok(correct as f32 / labels.len() as f32)
}
