use crate::types::{DatasetError, DatasetResult, ImageSet};
use rand::seq::SliceRandom;
use rand::Rng;

/// Named dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
}

/// Train and validation sets sharing one input shape and label space.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageSet,
    pub valid: ImageSet,
    pub num_classes: usize,
}

impl DatasetSplits {
    pub fn new(train: ImageSet, valid: ImageSet) -> DatasetResult<Self> {
        if train.data_shape() != valid.data_shape() {
            return Err(DatasetError::ShapeMismatch {
                got: valid.sample_numel(),
                expected: train.sample_numel(),
                shape: train.data_shape(),
            });
        }
        let num_classes = train.num_classes().max(valid.num_classes());
        Ok(Self {
            train,
            valid,
            num_classes,
        })
    }

    pub fn get(&self, split: Split) -> &ImageSet {
        match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
        }
    }

    pub fn data_shape(&self) -> [usize; 3] {
        self.train.data_shape()
    }
}

/// Shuffle and hold out `valid_ratio` of `set` as a validation split.
pub fn split_holdout<R: Rng + ?Sized>(
    set: &ImageSet,
    valid_ratio: f32,
    rng: &mut R,
) -> DatasetResult<DatasetSplits> {
    if set.is_empty() {
        return Err(DatasetError::Empty("dataset"));
    }
    let mut order: Vec<usize> = (0..set.len()).collect();
    order.shuffle(rng);
    let ratio = valid_ratio.clamp(0.0, 1.0);
    let n_valid = ((set.len() as f32) * ratio).round() as usize;
    let (valid_idx, train_idx) = order.split_at(n_valid.min(set.len()));
    DatasetSplits::new(set.subset(train_idx)?, set.subset(valid_idx)?)
}

/// Draw `n` samples without replacement (all of them if `n >= len`).
pub fn sample_batch<R: Rng + ?Sized>(set: &ImageSet, n: usize, rng: &mut R) -> DatasetResult<ImageSet> {
    let amount = n.min(set.len());
    let mut picked = rand::seq::index::sample(rng, set.len(), amount).into_vec();
    picked.sort_unstable();
    set.subset(&picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toy(n: usize) -> ImageSet {
        let inputs: Vec<f32> = (0..n).map(|v| v as f32).collect();
        let labels: Vec<i64> = (0..n as i64).map(|l| l % 3).collect();
        ImageSet::from_parts([1, 1, 1], inputs, labels).unwrap()
    }

    #[test]
    fn holdout_partitions_all_samples() {
        let set = toy(10);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let splits = split_holdout(&set, 0.3, &mut rng).unwrap();
        assert_eq!(splits.valid.len(), 3);
        assert_eq!(splits.train.len(), 7);
        let mut all: Vec<f32> = splits
            .train
            .inputs()
            .iter()
            .chain(splits.valid.inputs())
            .copied()
            .collect();
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(all, (0..10).map(|v| v as f32).collect::<Vec<_>>());
        assert_eq!(splits.num_classes, 3);
    }

    #[test]
    fn sample_batch_is_without_replacement() {
        let set = toy(20);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let sub = sample_batch(&set, 8, &mut rng).unwrap();
        assert_eq!(sub.len(), 8);
        let mut values = sub.inputs().to_vec();
        values.dedup();
        assert_eq!(values.len(), 8);
        assert_eq!(sample_batch(&set, 100, &mut rng).unwrap().len(), 20);
    }
}
