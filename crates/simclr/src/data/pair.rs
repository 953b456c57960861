//! Paired-view dataset adapter and batch collation.
//!
//! [`PairDataset`] wraps a base image dataset and returns two independently
//! augmented views per index. Each view draws from its own `StdRng`, seeded
//! from `(seed, epoch, index, view)`, so views are reproducible regardless of
//! which loader worker produced them, and re-drawn every epoch.
//!
//! [`PairBatches`] groups a fresh permutation of the whole dataset into full
//! batches, one per item. burn's multi-worker loader hands each worker a
//! contiguous range of items, so every worker still produces whole batches.
//!
//! [`PairBatcher`] flattens N pairs into a `(2N, c, h, w)` tensor where rows
//! `2k` and `2k + 1` are the two views of source image `k`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::augment::{to_chw, Augmenter};
use crate::data::cifar::CifarImage;
use crate::model::bridge::images_to_tensor;

/// Stream tag separating the batch-order seed from per-view seeds.
const ORDER_STREAM: u64 = u64::MAX;

/// Shared handle to the current epoch, read by loader workers.
#[derive(Clone, Debug, Default)]
pub struct EpochCounter(Arc<AtomicUsize>);

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, epoch: usize) {
        self.0.store(epoch, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Two augmented views of one source image, CHW `f32` each.
#[derive(Clone, Debug)]
pub struct ImagePair {
    pub views: [Vec<f32>; 2],
    pub label: u8,
}

/// Emits an [`ImagePair`] per base-dataset index.
pub struct PairDataset<D> {
    base: D,
    augmenter: Augmenter,
    seed: u64,
    epoch: EpochCounter,
}

impl<D: Dataset<CifarImage>> PairDataset<D> {
    pub fn new(base: D, augmenter: Augmenter, seed: u64) -> Self {
        Self {
            base,
            augmenter,
            seed,
            epoch: EpochCounter::new(),
        }
    }

    /// Handle the training loop uses to advance the augmentation epoch.
    pub fn epoch_counter(&self) -> EpochCounter {
        self.epoch.clone()
    }

    /// Output `(c, h, w)` of every view.
    pub fn view_shape(&self) -> [usize; 3] {
        let size = self.augmenter.config().crop_size;
        [3, size, size]
    }

    /// Hashing the stream coordinates instead of drawing from a shared rng
    /// keeps a view identical whichever worker builds it, in whatever order.
    fn stream_seed(&self, parts: &[u64]) -> u64 {
        parts
            .iter()
            .fold(splitmix64(self.seed), |h, &part| splitmix64(h ^ part))
    }

    fn view_seed(&self, index: usize, view: usize) -> u64 {
        self.stream_seed(&[self.epoch.get() as u64, index as u64, view as u64])
    }
}

impl<D: Dataset<CifarImage>> Dataset<ImagePair> for PairDataset<D> {
    fn get(&self, index: usize) -> Option<ImagePair> {
        let source = self.base.get(index)?;
        let image = source.to_image();
        let views = [0, 1].map(|view| {
            let mut rng = StdRng::seed_from_u64(self.view_seed(index, view));
            to_chw(&self.augmenter.apply(&image, &mut rng))
        });
        Some(ImagePair {
            views,
            label: source.label,
        })
    }

    fn len(&self) -> usize {
        self.base.len()
    }
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Full batches of pairs over a per-epoch permutation of the whole dataset.
///
/// Item `k` holds the pairs at positions `k * batch_size..(k + 1) * batch_size`
/// of the current epoch's permutation. The trailing `len % batch_size` images
/// of each permutation are left out.
pub struct PairBatches<D> {
    pairs: PairDataset<D>,
    batch_size: usize,
    order: Mutex<Option<(usize, Arc<Vec<usize>>)>>,
}

impl<D: Dataset<CifarImage>> PairBatches<D> {
    /// # Panics
    /// Panics if `batch_size` is zero.
    pub fn new(pairs: PairDataset<D>, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        Self {
            pairs,
            batch_size,
            order: Mutex::new(None),
        }
    }

    /// Permutation of every source index for the current epoch.
    pub fn epoch_order(&self) -> Arc<Vec<usize>> {
        let epoch = self.pairs.epoch.get();
        let mut cached = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_epoch, order)) = cached.as_ref() {
            if *cached_epoch == epoch {
                return order.clone();
            }
        }

        let mut order: Vec<usize> = (0..self.pairs.len()).collect();
        let seed = self.pairs.stream_seed(&[epoch as u64, ORDER_STREAM]);
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let order = Arc::new(order);
        *cached = Some((epoch, order.clone()));
        order
    }
}

impl<D: Dataset<CifarImage>> Dataset<Vec<ImagePair>> for PairBatches<D> {
    fn get(&self, index: usize) -> Option<Vec<ImagePair>> {
        if index >= self.len() {
            return None;
        }
        let order = self.epoch_order();
        order[index * self.batch_size..(index + 1) * self.batch_size]
            .iter()
            .map(|&i| self.pairs.get(i))
            .collect()
    }

    fn len(&self) -> usize {
        self.pairs.len() / self.batch_size
    }
}

/// A collated batch of N pairs.
#[derive(Clone, Debug)]
pub struct PairBatch<B: Backend> {
    /// `(2N, c, h, w)`, views of image `k` at rows `2k` and `2k + 1`.
    pub views: Tensor<B, 4>,
    /// `(N,)` source labels (unused by the contrastive objective).
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> PairBatch<B> {
    /// Number of source images in the batch.
    pub fn num_pairs(&self) -> usize {
        self.labels.dims()[0]
    }
}

/// Collates pre-grouped [`ImagePair`]s into a [`PairBatch`] on a fixed device.
#[derive(Clone, Debug)]
pub struct PairBatcher<B: Backend> {
    device: B::Device,
    view_shape: [usize; 3],
}

impl<B: Backend> PairBatcher<B> {
    pub fn new(device: B::Device, view_shape: [usize; 3]) -> Self {
        Self { device, view_shape }
    }
}

impl<B: Backend> Batcher<Vec<ImagePair>, PairBatch<B>> for PairBatcher<B> {
    fn batch(&self, items: Vec<Vec<ImagePair>>) -> PairBatch<B> {
        let pairs: Vec<ImagePair> = items.into_iter().flatten().collect();
        let labels: Vec<i64> = pairs.iter().map(|p| p.label as i64).collect();
        let views: Vec<&[f32]> = pairs
            .iter()
            .flat_map(|p| p.views.iter().map(Vec::as_slice))
            .collect();

        PairBatch {
            views: images_to_tensor::<B, _>(&views, self.view_shape, &self.device),
            labels: Tensor::from_data(TensorData::new(labels, [pairs.len()]), &self.device),
        }
    }
}

/// Build a multi-worker loader yielding `len / batch_size` full batches per
/// epoch, globally shuffled with the dataset's seed.
///
/// `workers == 0` loads on the calling thread.
pub fn pair_loader<B, D>(
    dataset: PairDataset<D>,
    batch_size: usize,
    workers: usize,
    device: &B::Device,
) -> Arc<dyn DataLoader<PairBatch<B>>>
where
    B: Backend,
    D: Dataset<CifarImage> + 'static,
{
    let batcher = PairBatcher::<B>::new(device.clone(), dataset.view_shape());
    let batches = PairBatches::new(dataset, batch_size);
    let workers = workers.min(batches.len());

    let builder = DataLoaderBuilder::new(batcher).batch_size(1);
    let builder = if workers > 0 {
        builder.num_workers(workers)
    } else {
        builder
    };
    builder.build(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::augment::AugmentConfig;
    use crate::data::cifar::Cifar10Dataset;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn dataset(n: usize) -> Cifar10Dataset {
        Cifar10Dataset::from_images(
            (0..n)
                .map(|i| CifarImage {
                    pixels: (0..3072).map(|p| ((p * (i + 3)) % 251) as u8).collect(),
                    label: i as u8,
                })
                .collect(),
        )
    }

    #[test]
    fn test_views_are_independent() {
        let pairs = PairDataset::new(dataset(2), Augmenter::new(AugmentConfig::new()), 0);
        let pair = pairs.get(1).unwrap();
        assert_eq!(pair.label, 1);
        assert_eq!(pair.views[0].len(), 3072);
        assert_ne!(pair.views[0], pair.views[1], "views must use distinct random draws");
    }

    #[test]
    fn test_views_reproducible_within_epoch() {
        let pairs = PairDataset::new(dataset(2), Augmenter::new(AugmentConfig::new()), 9);
        let a = pairs.get(0).unwrap();
        let b = pairs.get(0).unwrap();
        assert_eq!(a.views, b.views);

        pairs.epoch_counter().set(1);
        let c = pairs.get(0).unwrap();
        assert_ne!(a.views[0], c.views[0], "a new epoch draws new views");
    }

    #[test]
    fn test_seed_changes_views() {
        let a = PairDataset::new(dataset(1), Augmenter::new(AugmentConfig::new()), 1);
        let b = PairDataset::new(dataset(1), Augmenter::new(AugmentConfig::new()), 2);
        assert_ne!(a.get(0).unwrap().views, b.get(0).unwrap().views);
    }

    #[test]
    fn test_out_of_range() {
        let pairs = PairDataset::new(dataset(2), Augmenter::new(AugmentConfig::new()), 0);
        assert!(pairs.get(2).is_none());
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_batch_layout() {
        let base = dataset(3);
        let originals: Vec<Vec<f32>> = base.images().iter().map(|i| i.to_unit_floats()).collect();
        let pairs = PairDataset::new(base, Augmenter::new(AugmentConfig::identity()), 0);
        let items: Vec<ImagePair> = (0..3).map(|i| pairs.get(i).unwrap()).collect();

        let batcher = PairBatcher::<TestBackend>::new(Default::default(), pairs.view_shape());
        let batch = batcher.batch(vec![items]);
        assert_eq!(batch.views.dims(), [6, 3, 32, 32]);
        assert_eq!(batch.num_pairs(), 3);

        for row in 0..6 {
            let view: Vec<f32> = batch
                .views
                .clone()
                .slice([row..row + 1, 0..3, 0..32, 0..32])
                .reshape([3072])
                .into_data()
                .to_vec()
                .unwrap();
            let source = &originals[row / 2];
            let max_diff = view
                .iter()
                .zip(source)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0_f32, f32::max);
            assert!(max_diff < 1e-6, "row {row} should come from image {}", row / 2);
        }
    }

    #[test]
    fn test_loader_delivers_every_pair_once() {
        let pairs = PairDataset::new(dataset(8), Augmenter::new(AugmentConfig::new()), 0);
        let loader = pair_loader::<TestBackend, _>(pairs, 2, 2, &Default::default());
        assert_eq!(loader.num_items(), 4);

        let mut labels: Vec<i64> = Vec::new();
        for batch in loader.iter() {
            assert_eq!(batch.views.dims()[0], 2 * batch.num_pairs());
            labels.extend(batch.labels.into_data().convert::<i64>().to_vec::<i64>().unwrap());
        }
        labels.sort_unstable();
        assert_eq!(labels, (0..8).collect::<Vec<i64>>());
    }

    #[test]
    fn test_uneven_worker_split_yields_full_batches() {
        // 10 images, batch 3: 3 full batches, spread over more workers than
        // divide them evenly.
        for workers in [0, 2, 3, 4, 16] {
            let pairs = PairDataset::new(dataset(10), Augmenter::new(AugmentConfig::new()), 5);
            let loader = pair_loader::<TestBackend, _>(pairs, 3, workers, &Default::default());
            assert_eq!(loader.num_items(), 3, "workers = {workers}");

            let mut labels: Vec<i64> = Vec::new();
            let mut batches = 0;
            for batch in loader.iter() {
                assert_eq!(batch.num_pairs(), 3, "workers = {workers}");
                labels.extend(batch.labels.into_data().convert::<i64>().to_vec::<i64>().unwrap());
                batches += 1;
            }
            assert_eq!(batches, 3, "workers = {workers}");
            labels.sort_unstable();
            labels.dedup();
            assert_eq!(labels.len(), 9, "no image repeats within an epoch");
        }
    }

    #[test]
    fn test_epoch_order_is_a_fresh_global_permutation() {
        let pairs = PairDataset::new(dataset(12), Augmenter::new(AugmentConfig::identity()), 3);
        let counter = pairs.epoch_counter();
        let batches = PairBatches::new(pairs, 3);
        assert_eq!(batches.len(), 4);

        let mut orders = Vec::new();
        let mut first_batch_sources = Vec::new();
        for epoch in 1..=6 {
            counter.set(epoch);
            let order = batches.epoch_order();
            let mut sorted = order.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..12).collect::<Vec<_>>());
            assert_eq!(batches.epoch_order(), order, "order is stable within an epoch");

            first_batch_sources.extend(batches.get(0).unwrap().iter().map(|p| p.label as usize));
            orders.push(order);
        }

        assert_ne!(orders[0], orders[1], "each epoch reshuffles");
        // A two-worker split would confine batch 0 to images 0..6.
        assert!(
            first_batch_sources.iter().any(|&i| i >= 6),
            "batch 0 only drew from the first half: {first_batch_sources:?}"
        );
        assert!(batches.get(4).is_none());
    }
}
