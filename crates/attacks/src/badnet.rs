use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use models::ImageModel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use training::{evaluate, train_classifier, BatchTransform, EvalResult, Identity, TrainConfig};
use trojan_dataset::{sample_batch, Batch, BatchIter, DatasetSplits, ImageSet, LoaderConfig};

use crate::error::{config_err, AttackResult};
use crate::watermark::Watermark;

/// Where poisoned samples enter training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainMode {
    /// Mark a fraction of every training batch on the fly.
    #[default]
    Batch,
    /// Append a fixed poisoned subset to the training set up front.
    Dataset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BadNetConfig {
    pub target_class: i64,
    /// Fraction of poisoned samples in the final training stream.
    pub poison_percent: f64,
    pub train_mode: TrainMode,
    pub seed: Option<u64>,
}

impl Default for BadNetConfig {
    fn default() -> Self {
        Self {
            target_class: 0,
            poison_percent: 0.01,
            train_mode: TrainMode::Batch,
            seed: None,
        }
    }
}

/// Clean and triggered validation results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttackReport {
    pub clean: EvalResult,
    /// Accuracy on this is the attack success rate.
    pub triggered: EvalResult,
}

impl AttackReport {
    pub fn clean_acc(&self) -> f64 {
        self.clean.acc
    }

    pub fn attack_success_rate(&self) -> f64 {
        self.triggered.acc
    }
}

/// BadNet: stamp a fixed trigger on a fraction of training inputs and relabel
/// them to the target class.
#[derive(Debug, Clone)]
pub struct BadNet<B: Backend> {
    cfg: BadNetConfig,
    mark: Watermark<B>,
    rng: StdRng,
}

impl<B: Backend> BadNet<B> {
    pub fn new(cfg: BadNetConfig, mark: Watermark<B>) -> AttackResult<Self> {
        if !(0.0..1.0).contains(&cfg.poison_percent) {
            return Err(config_err(format!(
                "poison_percent must lie in [0, 1), got {}",
                cfg.poison_percent
            )));
        }
        if cfg.target_class < 0 {
            return Err(config_err("target_class must be non-negative"));
        }
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Ok(Self { cfg, mark, rng })
    }

    pub fn name(&self) -> &'static str {
        "badnet"
    }

    pub fn config(&self) -> &BadNetConfig {
        &self.cfg
    }

    pub fn target_class(&self) -> i64 {
        self.cfg.target_class
    }

    pub fn poison_percent(&self) -> f64 {
        self.cfg.poison_percent
    }

    pub fn train_mode(&self) -> TrainMode {
        self.cfg.train_mode
    }

    /// Poisoned-to-clean ratio: `p / (1 - p)`.
    pub fn poison_ratio(&self) -> f64 {
        self.cfg.poison_percent / (1.0 - self.cfg.poison_percent)
    }

    pub fn mark(&self) -> &Watermark<B> {
        &self.mark
    }

    pub fn mark_mut(&mut self) -> &mut Watermark<B> {
        &mut self.mark
    }

    pub fn into_mark(self) -> Watermark<B> {
        self.mark
    }

    pub fn add_mark(&mut self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.mark.add_mark(input, None)
    }

    pub fn get_filename(&self) -> String {
        let (h, w) = self.mark.mark_size();
        format!(
            "{}_tar{}_alpha{:.2}_mark({},{})",
            self.name(),
            self.cfg.target_class,
            self.mark.mark_alpha(),
            h,
            w
        )
    }

    /// Marked copies of `set`, all relabeled to the target class.
    pub fn mark_set(&mut self, set: &ImageSet, device: &B::Device) -> AttackResult<ImageSet> {
        let mut out = ImageSet::new(set.data_shape());
        let mut iter = BatchIter::new(set, LoaderConfig::eval(256));
        let numel = set.sample_numel();
        while let Some(batch) = iter.next_batch::<B>(device)? {
            let marked: Vec<f32> = self
                .add_mark(batch.input)
                .into_data()
                .iter::<f32>()
                .collect();
            for chunk in marked.chunks_exact(numel) {
                out.push(chunk, self.cfg.target_class)?;
            }
        }
        Ok(out)
    }

    /// `poison_num` samples drawn from `clean` without replacement, marked
    /// and relabeled to the target class.
    pub fn get_poison_dataset(
        &mut self,
        clean: &ImageSet,
        poison_num: usize,
        device: &B::Device,
    ) -> AttackResult<ImageSet> {
        let picked = sample_batch(clean, poison_num, &mut self.rng)?;
        self.mark_set(&picked, device)
    }

    /// Number of rows to poison in a batch of `n`: `n * ratio` with the
    /// fractional part rounded up stochastically.
    fn poison_count(&mut self, n: usize) -> usize {
        let exact = n as f64 * self.poison_ratio();
        let mut count = exact.trunc() as usize;
        if self.rng.random::<f64>() < exact.fract() {
            count += 1;
        }
        count.min(n)
    }

    /// Prepend marked, relabeled copies of the first rows of `batch`.
    pub fn poison_batch(&mut self, batch: Batch<B>) -> Batch<B> {
        let count = self.poison_count(batch.len());
        let rows: Vec<usize> = (0..count).collect();
        let Some(picked) = batch.select(&rows) else {
            return batch;
        };
        let marked = Batch {
            input: self.add_mark(picked.input),
            ..picked
        }
        .with_target(self.cfg.target_class);
        let mut labels = marked.labels;
        labels.extend_from_slice(&batch.labels);
        Batch {
            input: Tensor::cat(vec![marked.input, batch.input], 0),
            label: Tensor::cat(vec![marked.label, batch.label], 0),
            labels,
        }
    }

    /// Clean accuracy on `valid`, and accuracy on marked non-target inputs
    /// relabeled to the target (attack success rate).
    pub fn validate_fn<M: ImageModel<B>>(
        &mut self,
        model: &M,
        valid: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> AttackResult<AttackReport> {
        let clean = evaluate(model, valid, batch_size, &mut Identity, device)?;
        let target = self.cfg.target_class;
        let others = valid.filter_labels(|l| l != target);
        let triggered = evaluate(
            model,
            &others,
            batch_size,
            &mut Triggered { attack: self },
            device,
        )?;
        println!(
            "Validate Clean           Loss: {:.4}, Acc: {:.2}",
            clean.loss, clean.acc
        );
        println!(
            "Validate Trigger Tgt     Loss: {:.4}, Acc: {:.2}",
            triggered.loss, triggered.acc
        );
        Ok(AttackReport { clean, triggered })
    }
}

impl<B: Backend> BatchTransform<B> for BadNet<B> {
    fn transform(&mut self, batch: Batch<B>) -> Batch<B> {
        self.poison_batch(batch)
    }
}

/// Marks every row and relabels it to the target.
struct Triggered<'a, B: Backend> {
    attack: &'a mut BadNet<B>,
}

impl<B: Backend> BatchTransform<B> for Triggered<'_, B> {
    fn transform(&mut self, batch: Batch<B>) -> Batch<B> {
        let target = self.attack.cfg.target_class;
        Batch {
            input: self.attack.add_mark(batch.input),
            ..batch
        }
        .with_target(target)
    }
}

impl<B: AutodiffBackend> BadNet<B> {
    /// Train `model` on the poisoned stream, then validate.
    pub fn attack<M>(
        &mut self,
        model: M,
        splits: &DatasetSplits,
        train_cfg: &TrainConfig,
        device: &B::Device,
    ) -> anyhow::Result<(M, AttackReport)>
    where
        M: ImageModel<B> + AutodiffModule<B>,
    {
        tracing::info!(
            attack = self.name(),
            target = self.cfg.target_class,
            poison_percent = self.cfg.poison_percent,
            mode = ?self.cfg.train_mode,
            "starting backdoor training"
        );
        let model = match self.cfg.train_mode {
            TrainMode::Batch => train_classifier(model, splits, train_cfg, self, device)?,
            TrainMode::Dataset => {
                let poison_num =
                    (splits.train.len() as f64 * self.poison_ratio()).round() as usize;
                let poison = self.get_poison_dataset(&splits.train, poison_num, device)?;
                let mixed = DatasetSplits {
                    train: splits.train.clone().concat(&poison)?,
                    valid: splits.valid.clone(),
                    num_classes: splits.num_classes,
                };
                train_classifier(model, &mixed, train_cfg, &mut Identity, device)?
            }
        };
        let report = self.validate_fn(&model, &splits.valid, train_cfg.batch_size, device)?;
        Ok((model, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::MarkConfig;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn attack(percent: f64) -> BadNet<B> {
        let device = Default::default();
        let mark = Watermark::new(
            [1, 4, 4],
            &MarkConfig {
                mark_height: 2,
                mark_width: 2,
                ..Default::default()
            },
            &device,
        )
        .unwrap();
        BadNet::new(
            BadNetConfig {
                target_class: 3,
                poison_percent: percent,
                seed: Some(1),
                ..Default::default()
            },
            mark,
        )
        .unwrap()
    }

    #[test]
    fn filename_encodes_target_alpha_and_size() {
        assert_eq!(attack(0.1).get_filename(), "badnet_tar3_alpha1.00_mark(2,2)");
    }

    #[test]
    fn out_of_range_percent_is_rejected() {
        let device = Default::default();
        let mark = Watermark::<B>::new([1, 4, 4], &MarkConfig::default(), &device).unwrap();
        let cfg = BadNetConfig {
            poison_percent: 1.0,
            ..Default::default()
        };
        assert!(BadNet::new(cfg, mark).is_err());
    }

    #[test]
    fn poison_batch_prepends_marked_targets() {
        let device = Default::default();
        // ratio = 0.5 / 0.5 = 1, so every row gets a marked copy.
        let mut badnet = attack(0.5);
        let batch = Batch::<B> {
            input: Tensor::zeros([4, 1, 4, 4], &device),
            label: Tensor::from_ints([0, 1, 2, 1], &device),
            labels: vec![0, 1, 2, 1],
        };
        let out = badnet.poison_batch(batch);
        assert_eq!(out.len(), 8);
        assert_eq!(out.labels, vec![3, 3, 3, 3, 0, 1, 2, 1]);
        let sums: Vec<f32> = out
            .input
            .sum_dim(3)
            .sum_dim(2)
            .sum_dim(1)
            .into_data()
            .iter::<f32>()
            .collect();
        assert_eq!(sums, vec![4.0, 4.0, 4.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn zero_percent_leaves_batches_alone() {
        let device = Default::default();
        let mut badnet = attack(0.0);
        let batch = Batch::<B> {
            input: Tensor::zeros([2, 1, 4, 4], &device),
            label: Tensor::from_ints([0, 1], &device),
            labels: vec![0, 1],
        };
        assert_eq!(badnet.poison_batch(batch).labels, vec![0, 1]);
    }

    #[test]
    fn poison_dataset_is_marked_and_retargeted() {
        let device = Default::default();
        let mut badnet = attack(0.1);
        let clean = ImageSet::from_parts([1, 4, 4], vec![0.0; 5 * 16], vec![0, 1, 2, 0, 1]).unwrap();
        let poison = badnet.get_poison_dataset(&clean, 3, &device).unwrap();
        assert_eq!(poison.len(), 3);
        assert!(poison.labels().iter().all(|l| *l == 3));
        assert_eq!(poison.input(0).unwrap().iter().sum::<f32>(), 4.0);
        assert_eq!(badnet.get_poison_dataset(&clean, 50, &device).unwrap().len(), 5);
    }
}
