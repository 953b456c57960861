//! Contrastive training: NT-Xent loss, disentangler pretraining, checkpoint
//! persistence, and the SGD training loop with cosine annealing.

pub mod checkpoint;
pub mod loss;
pub mod metrics;
pub mod pretrain;
pub mod trainer;
