//! Image data: CIFAR-10 loading, stochastic augmentation and paired-view batching.

pub mod augment;
pub mod cifar;
pub mod pair;
