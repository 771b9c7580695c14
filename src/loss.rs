//! Loss function(s)
//!
//! Terminal layers mapping class scores of shape `(N, C)` and integer labels to a scalar loss
//! averaged over the batch, together with the gradient of the loss w.r.t. the scores.

use ndarray::{Array2, ArrayView2, Axis};
use thiserror::Error;

use crate::scalar::Scalar;

/// Errors for the loss functions
#[derive(Debug, Error)]
pub enum LossError {
    #[error("Got {labels} labels for {rows} rows of scores")]
    LabelCountMismatch { rows: usize, labels: usize },
    #[error("Label {label} at index {index} is outside [0, {num_classes})")]
    LabelOutOfRange {
        index: usize,
        label: usize,
        num_classes: usize,
    },
    #[error("Cannot compute a loss over an empty batch")]
    EmptyBatch,
}

fn check_labels<T>(scores: &ArrayView2<T>, labels: &[usize]) -> Result<(), LossError> {
    if scores.nrows() != labels.len() {
        return Err(LossError::LabelCountMismatch {
            rows: scores.nrows(),
            labels: labels.len(),
        });
    }
    if labels.is_empty() {
        return Err(LossError::EmptyBatch);
    }
    let num_classes = scores.ncols();
    if let Some((index, &label)) = labels.iter().enumerate().find(|(_, l)| **l >= num_classes) {
        return Err(LossError::LabelOutOfRange {
            index,
            label,
            num_classes,
        });
    }
    Ok(())
}

/// Multiclass SVM (hinge) loss with margin 1
pub fn svm_loss<T: Scalar>(
    scores: ArrayView2<T>,
    labels: &[usize],
) -> Result<(T, Array2<T>), LossError> {
    check_labels(&scores, labels)?;
    let n = T::cast(labels.len() as f64);
    let mut loss = T::zero();
    let mut dx = Array2::zeros(scores.raw_dim());

    for ((row, mut drow), &y) in scores.outer_iter().zip(dx.outer_iter_mut()).zip(labels) {
        let correct = row[y];
        let mut n_positive = T::zero();
        for (j, &s) in row.iter().enumerate() {
            if j == y {
                continue;
            }
            let margin = s - correct + T::one();
            if margin > T::zero() {
                loss += margin;
                drow[j] = T::one();
                n_positive += T::one();
            }
        }
        drow[y] = -n_positive;
    }

    dx /= n;
    Ok((loss / n, dx))
}

/// Softmax cross-entropy loss. Scores are shifted by their row maximum before
/// exponentiating so large scores do not overflow.
pub fn softmax_loss<T: Scalar>(
    scores: ArrayView2<T>,
    labels: &[usize],
) -> Result<(T, Array2<T>), LossError> {
    check_labels(&scores, labels)?;
    let n = T::cast(labels.len() as f64);

    let row_max = scores.fold_axis(Axis(1), T::neg_infinity(), |&m, &v| m.max(v));
    let shifted = &scores - &row_max.insert_axis(Axis(1));
    let log_sum_exp = shifted
        .mapv(|v| v.exp())
        .sum_axis(Axis(1))
        .mapv(|v| v.ln())
        .insert_axis(Axis(1));
    let log_probs = shifted - &log_sum_exp;

    let mut loss = T::zero();
    for (row, &y) in log_probs.outer_iter().zip(labels) {
        loss -= row[y];
    }

    let mut dx = log_probs.mapv(|v| v.exp());
    for (mut row, &y) in dx.outer_iter_mut().zip(labels) {
        row[y] -= T::one();
    }
    dx /= n;
    Ok((loss / n, dx))
}

/// Selects the terminal loss of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Loss {
    #[default]
    Softmax,
    Svm,
}

impl Loss {
    pub fn call<T: Scalar>(
        &self,
        scores: ArrayView2<T>,
        labels: &[usize],
    ) -> Result<(T, Array2<T>), LossError> {
        match self {
            Loss::Softmax => softmax_loss(scores, labels),
            Loss::Svm => svm_loss(scores, labels),
        }
    }
}
