//! Defenses that flag poisoned samples inside a training set.

use attacks::{BackdoorAttack, TrainMode};
use burn::tensor::backend::Backend;
use models::ImageModel;
use rand::rngs::StdRng;
use rand::SeedableRng;
use trojan_core::ClassificationReport;
use trojan_dataset::{sample_batch, ImageSet};

use crate::backdoor::DefenseContext;
use crate::error::{DefenseError, DefenseResult};
use crate::input_filtering::DetectionReport;
use crate::score::true_labels;

/// Scores `clean ++ poison` and labels each sample; `true` means poisoned.
///
/// Both returned vectors follow the `[clean..., poison...]` order.
pub trait TrainingFilter<B: Backend> {
    fn name(&self) -> &'static str;

    fn get_pred_labels<M: ImageModel<B>>(
        &mut self,
        model: &M,
        clean: &ImageSet,
        poison: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> DefenseResult<(Vec<f32>, Vec<bool>)>;
}

pub struct TrainingFiltering<F> {
    filter: F,
    clean_set: ImageSet,
    poison_set: ImageSet,
}

impl<F> TrainingFiltering<F> {
    /// Build the clean/poison mix to inspect.
    ///
    /// Without `defense_input_num` the whole training set is used along with
    /// a full poison set. With `Some(n)`, `floor(n * poison_percent)` poisoned
    /// and the remaining clean samples are drawn without replacement.
    pub fn new<B, M, A>(
        ctx: &mut DefenseContext<'_, B, M, A>,
        filter: F,
        defense_input_num: Option<usize>,
        seed: Option<u64>,
    ) -> DefenseResult<Self>
    where
        B: Backend,
        M: ImageModel<B>,
        A: BackdoorAttack<B>,
    {
        let train = &ctx.splits.train;
        let badnet = ctx.attack.badnet_mut();
        let (clean_set, poison_set) = match defense_input_num {
            None => {
                let poison_num = match badnet.train_mode() {
                    TrainMode::Batch => train.len(),
                    TrainMode::Dataset => {
                        (train.len() as f64 * badnet.poison_ratio()).round() as usize
                    }
                };
                let poison = badnet.get_poison_dataset(train, poison_num, &ctx.device)?;
                (train.clone(), poison)
            }
            Some(n) => {
                if n == 0 {
                    return Err(DefenseError::Config(
                        "defense_input_num must be positive".into(),
                    ));
                }
                let poison_num = (n as f64 * badnet.poison_percent()).floor() as usize;
                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_rng(&mut rand::rng()),
                };
                let clean = sample_batch(train, n - poison_num, &mut rng)?;
                let poison = badnet.get_poison_dataset(train, poison_num, &ctx.device)?;
                (clean, poison)
            }
        };
        tracing::info!(
            clean = clean_set.len(),
            poison = poison_set.len(),
            "training filtering inputs"
        );
        Ok(Self {
            filter,
            clean_set,
            poison_set,
        })
    }

    pub fn clean_set(&self) -> &ImageSet {
        &self.clean_set
    }

    pub fn poison_set(&self) -> &ImageSet {
        &self.poison_set
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn detect<B, M, A>(
        &mut self,
        ctx: &mut DefenseContext<'_, B, M, A>,
    ) -> DefenseResult<DetectionReport>
    where
        B: Backend,
        M: ImageModel<B>,
        A: BackdoorAttack<B>,
        F: TrainingFilter<B>,
    {
        ctx.prepare()?;
        let (mut clean_scores, y_pred) = self.filter.get_pred_labels(
            ctx.model,
            &self.clean_set,
            &self.poison_set,
            ctx.batch_size,
            &ctx.device,
        )?;
        let y_true = true_labels(self.clean_set.len(), self.poison_set.len());
        let metrics = ClassificationReport::from_labels(&y_true, &y_pred)?;
        metrics.print();
        let poison_scores = clean_scores.split_off(self.clean_set.len().min(clean_scores.len()));
        Ok(DetectionReport {
            defense: self.filter.name().to_string(),
            metrics,
            clean_scores,
            poison_scores,
            y_pred,
        })
    }
}
