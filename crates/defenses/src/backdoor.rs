use attacks::BackdoorAttack;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::ImageModel;
use trojan_dataset::DatasetSplits;

use crate::error::DefenseResult;

/// Everything a backdoor defense works against: the model under test, its
/// data, and the attack whose trigger is the ground truth.
pub struct DefenseContext<'a, B: Backend, M, A> {
    pub model: &'a M,
    pub splits: &'a DatasetSplits,
    pub attack: &'a mut A,
    pub device: B::Device,
    pub batch_size: usize,
    /// The model is the clean original instead of the attacked one.
    pub original: bool,
}

/// Copy of the attack's trigger taken before a defense runs.
#[derive(Debug, Clone)]
pub struct RealMark<B: Backend> {
    pub mark: Tensor<B, 3>,
    /// Full-frame `(H, W)` alpha mask.
    pub mask: Tensor<B, 2>,
    pub mark_size: (usize, usize),
    pub random_pos: bool,
}

impl<'a, B, M, A> DefenseContext<'a, B, M, A>
where
    B: Backend,
    M: ImageModel<B>,
    A: BackdoorAttack<B>,
{
    pub fn new(model: &'a M, splits: &'a DatasetSplits, attack: &'a mut A, device: B::Device) -> Self {
        Self {
            model,
            splits,
            attack,
            device,
            batch_size: 64,
            original: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_original(mut self, original: bool) -> Self {
        self.original = original;
        self
    }

    pub fn target_class(&self) -> i64 {
        self.attack.target_class()
    }

    /// `{attack}_{attack stem}`, naming the experiment in logs and records.
    pub fn get_filename(&self) -> String {
        format!("{}_{}", self.attack.name(), self.attack.get_filename())
    }

    /// Report the attack's numbers on the model, then snapshot its mark.
    pub fn prepare(&mut self) -> DefenseResult<RealMark<B>> {
        tracing::info!(
            experiment = %self.get_filename(),
            original = self.original,
            "preparing defense"
        );
        self.attack
            .validate_fn(self.model, &self.splits.valid, self.batch_size, &self.device)?;
        let mark = self.attack.mark();
        Ok(RealMark {
            mark: mark.mark().clone(),
            mask: mark.get_mask(),
            mark_size: mark.mark_size(),
            random_pos: mark.random_pos(),
        })
    }
}
