//! Tensor bridge: utilities to convert between host image buffers
//! (`Vec<f32>`, CHW layout) and burn tensors.
//!
//! The data pipeline and augmentations work on plain `f32` buffers so they can
//! run on loader worker threads without touching a device; the model needs
//! `Tensor<B, 4>` inputs.

use burn::prelude::*;
use burn::tensor::TensorData;

/// Convert a batch of CHW `f32` images to a burn 4D tensor `(batch, c, h, w)`.
///
/// # Panics
/// Panics if `images` is empty or if any buffer does not have `c * h * w` values.
pub fn images_to_tensor<B: Backend, I: AsRef<[f32]>>(
    images: &[I],
    shape: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    assert!(!images.is_empty(), "images must not be empty");
    let [c, h, w] = shape;
    let numel = c * h * w;
    assert!(numel > 0, "image shape must be non-empty, got {shape:?}");

    let mut flat = Vec::with_capacity(images.len() * numel);
    for (i, image) in images.iter().enumerate() {
        let image = image.as_ref();
        assert_eq!(
            image.len(),
            numel,
            "image {i} has {} values, expected {numel} for shape {shape:?}",
            image.len()
        );
        flat.extend_from_slice(image);
    }

    Tensor::from_data(TensorData::new(flat, [images.len(), c, h, w]), device)
}

/// Extract a single f64 scalar from a burn 1D tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let val: f64 = tensor.into_scalar().elem();
    val
}
