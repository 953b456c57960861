//! Model components: CIFAR ResNet backbone, predictability-minimization
//! disentangler, the SimCLR representation model, and the tensor bridge
//! between host image buffers and burn tensors.

pub mod bridge;
pub mod disentangler;
pub mod resnet;
pub mod simclr;
