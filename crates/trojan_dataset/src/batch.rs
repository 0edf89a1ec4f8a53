//! Batch iteration for training, validation and mark optimization.

use crate::types::{DatasetError, DatasetResult, ImageSet};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Shuffle sample order once per iterator.
    pub shuffle: bool,
    /// Seed for reproducible shuffling.
    pub seed: Option<u64>,
    /// Drop the last partial batch.
    pub drop_last: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            shuffle: true,
            seed: None,
            drop_last: false,
        }
    }
}

impl LoaderConfig {
    /// Sequential order, keep partial batches (evaluation settings).
    pub fn eval(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            seed: None,
            drop_last: false,
        }
    }
}

/// A batch of inputs `[N, C, H, W]` with labels `[N]`.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    pub input: Tensor<B, 4>,
    pub label: Tensor<B, 1, Int>,
    /// Host copy of `label`.
    pub labels: Vec<i64>,
}

impl<B: Backend> Batch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Keep only the rows at `rows` (sorted, in range).
    pub fn select(&self, rows: &[usize]) -> Option<Self> {
        if rows.is_empty() {
            return None;
        }
        let device = self.input.device();
        let idx: Vec<i64> = rows.iter().map(|r| *r as i64).collect();
        let idx = Tensor::<B, 1, Int>::from_data(TensorData::new(idx, [rows.len()]), &device);
        let labels: Vec<i64> = rows.iter().map(|r| self.labels[*r]).collect();
        Some(Self {
            input: self.input.clone().select(0, idx.clone()),
            label: self.label.clone().select(0, idx),
            labels,
        })
    }

    /// Same inputs with every label replaced by `target`.
    pub fn with_target(&self, target: i64) -> Self {
        let n = self.len();
        Self {
            input: self.input.clone(),
            label: Tensor::<B, 1, Int>::full([n], target, &self.input.device()),
            labels: vec![target; n],
        }
    }
}

/// Iterates an `ImageSet` in batches; one pass per iterator.
pub struct BatchIter<'a> {
    set: &'a ImageSet,
    order: Vec<usize>,
    cursor: usize,
    cfg: LoaderConfig,
    processed_samples: usize,
    processed_batches: usize,
    images_buf: Vec<f32>,
    labels_buf: Vec<i64>,
}

impl<'a> BatchIter<'a> {
    pub fn new(set: &'a ImageSet, cfg: LoaderConfig) -> Self {
        let mut order: Vec<usize> = (0..set.len()).collect();
        if cfg.shuffle {
            let mut rng = match cfg.seed {
                Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
                None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
            };
            order.shuffle(&mut rng);
        }
        Self {
            set,
            order,
            cursor: 0,
            cfg,
            processed_samples: 0,
            processed_batches: 0,
            images_buf: Vec::new(),
            labels_buf: Vec::new(),
        }
    }

    pub fn processed_samples(&self) -> usize {
        self.processed_samples
    }

    pub fn processed_batches(&self) -> usize {
        self.processed_batches
    }

    /// Batches this iterator yields in total.
    pub fn num_batches(&self) -> usize {
        let bs = self.cfg.batch_size.max(1);
        if self.cfg.drop_last {
            self.order.len() / bs
        } else {
            self.order.len().div_ceil(bs)
        }
    }

    pub fn next_batch<B: Backend>(&mut self, device: &B::Device) -> DatasetResult<Option<Batch<B>>> {
        let batch_size = self.cfg.batch_size.max(1);
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + batch_size).min(self.order.len());
        if self.cfg.drop_last && end - self.cursor < batch_size {
            self.cursor = self.order.len();
            return Ok(None);
        }

        self.images_buf.clear();
        self.labels_buf.clear();
        for &i in &self.order[self.cursor..end] {
            self.images_buf.extend_from_slice(self.set.input(i)?);
            self.labels_buf.push(self.set.labels()[i]);
        }
        self.cursor = end;

        let batch_len = self.labels_buf.len();
        if batch_len == 0 {
            return Err(DatasetError::Empty("batch"));
        }
        let [c, h, w] = self.set.data_shape();
        let input = Tensor::<B, 1>::from_floats(self.images_buf.as_slice(), device)
            .reshape([batch_len, c, h, w]);
        let label = Tensor::<B, 1, Int>::from_data(
            TensorData::new(self.labels_buf.clone(), [batch_len]),
            device,
        );

        self.processed_samples += batch_len;
        self.processed_batches += 1;

        Ok(Some(Batch {
            input,
            label,
            labels: self.labels_buf.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn toy(n: usize) -> ImageSet {
        let inputs: Vec<f32> = (0..n * 2).map(|v| v as f32).collect();
        let labels: Vec<i64> = (0..n as i64).collect();
        ImageSet::from_parts([1, 1, 2], inputs, labels).unwrap()
    }

    #[test]
    fn sequential_batches_cover_everything() {
        let set = toy(5);
        let device = Default::default();
        let mut iter = BatchIter::new(&set, LoaderConfig::eval(2));
        assert_eq!(iter.num_batches(), 3);
        let mut seen = Vec::new();
        while let Some(batch) = iter.next_batch::<B>(&device).unwrap() {
            assert_eq!(&batch.input.dims()[1..], &[1, 1, 2]);
            seen.extend(batch.labels);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(iter.processed_samples(), 5);
    }

    #[test]
    fn drop_last_skips_partial_batch() {
        let set = toy(5);
        let device = Default::default();
        let cfg = LoaderConfig {
            batch_size: 2,
            shuffle: false,
            seed: None,
            drop_last: true,
        };
        let mut iter = BatchIter::new(&set, cfg);
        assert_eq!(iter.num_batches(), 2);
        let mut count = 0;
        while iter.next_batch::<B>(&device).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn seeded_shuffle_is_reproducible() {
        let set = toy(16);
        let device = Default::default();
        let cfg = LoaderConfig {
            batch_size: 16,
            shuffle: true,
            seed: Some(7),
            drop_last: false,
        };
        let a = BatchIter::new(&set, cfg.clone())
            .next_batch::<B>(&device)
            .unwrap()
            .unwrap()
            .labels;
        let b = BatchIter::new(&set, cfg)
            .next_batch::<B>(&device)
            .unwrap()
            .unwrap()
            .labels;
        assert_eq!(a, b);
    }

    #[test]
    fn select_and_retarget() {
        let set = toy(4);
        let device = Default::default();
        let batch = BatchIter::new(&set, LoaderConfig::eval(4))
            .next_batch::<B>(&device)
            .unwrap()
            .unwrap();
        let picked = batch.select(&[1, 3]).unwrap();
        assert_eq!(picked.labels, vec![1, 3]);
        assert_eq!(picked.input.dims()[0], 2);
        let retargeted = picked.with_target(9);
        let labels: Vec<i64> = retargeted.label.into_data().iter::<i64>().collect();
        assert_eq!(labels, vec![9, 9]);
        assert!(batch.select(&[]).is_none());
    }
}
