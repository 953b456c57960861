//! Normalized-temperature cross-entropy (NT-Xent) loss for paired views.
//!
//! Rows of the embedding matrix are laid out in pairs: rows `2k` and `2k + 1`
//! are the two views of source image `k`. Every other row in the batch is a
//! negative for both of them.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::TensorData;

/// Offset subtracted from self-similarities so they vanish under softmax.
const SELF_SIMILARITY_OFFSET: f32 = 1e5;
/// Floor applied to cosine similarities.
const MIN_SIMILARITY: f64 = 1e-7;
const NORM_EPS: f64 = 1e-12;

/// Target column for each row: the other view of the same pair.
pub fn positive_pair_targets(rows: usize) -> Vec<usize> {
    (0..rows).map(|i| if i % 2 == 0 { i + 1 } else { i - 1 }).collect()
}

/// NT-Xent loss.
///
/// # Arguments
/// - `x`: shape `(2N, D)`, projections of paired views
/// - `temperature`: similarity divisor, must be positive
///
/// # Returns
/// Scalar loss tensor of shape `(1,)`, the mean cross-entropy over all `2N` rows.
///
/// # Panics
/// Panics if the row count is odd.
pub fn nt_xent_loss<B: Backend>(x: Tensor<B, 2>, temperature: f64) -> Tensor<B, 1> {
    let device = x.device();
    let [rows, _dim] = x.dims();
    assert!(
        rows % 2 == 0,
        "nt_xent requires an even number of rows (pairs of views), got {rows}"
    );

    let norms = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .clamp_min(NORM_EPS); // (2N, 1)
    let x = x / norms;

    let similarity = x.clone().matmul(x.transpose()).clamp_min(MIN_SIMILARITY) / temperature;
    let logits = similarity - self_mask::<B>(rows, &device);

    let targets: Vec<i64> = positive_pair_targets(rows)
        .into_iter()
        .map(|t| t as i64)
        .collect();
    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [rows]), &device);

    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, targets)
}

/// `(rows, rows)` matrix with [`SELF_SIMILARITY_OFFSET`] on the diagonal.
fn self_mask<B: Backend>(rows: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0_f32; rows * rows];
    for i in 0..rows {
        values[i * rows + i] = SELF_SIMILARITY_OFFSET;
    }
    Tensor::from_data(TensorData::new(values, [rows, rows]), device)
}
