//! Defenses that score individual test inputs for the presence of a trigger.

use attacks::BackdoorAttack;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::ImageModel;
use serde::Serialize;
use trojan_core::ClassificationReport;
use trojan_dataset::{BatchIter, LoaderConfig};

use crate::backdoor::DefenseContext;
use crate::error::{DefenseError, DefenseResult};
use crate::score::{true_labels, RankSplit, ScoreToLabel};

/// Scores a batch of inputs; higher means more likely poisoned.
pub trait InputFilter<B: Backend> {
    fn name(&self) -> &'static str;

    fn check<M: ImageModel<B>>(
        &mut self,
        model: &M,
        input: Tensor<B, 4>,
        poison: bool,
    ) -> DefenseResult<Vec<f32>>;
}

/// Outcome of an input- or training-filtering run.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub defense: String,
    pub metrics: ClassificationReport,
    pub clean_scores: Vec<f32>,
    pub poison_scores: Vec<f32>,
    pub y_pred: Vec<bool>,
}

pub struct InputFiltering<F, S = RankSplit> {
    filter: F,
    defense_input_num: usize,
    policy: S,
}

impl<F> InputFiltering<F, RankSplit> {
    /// `defense_input_num`: correctly classified clean inputs to test (100 by default).
    pub fn new(filter: F, defense_input_num: usize) -> DefenseResult<Self> {
        if defense_input_num == 0 {
            return Err(DefenseError::Config(
                "defense_input_num must be positive".into(),
            ));
        }
        Ok(Self {
            filter,
            defense_input_num,
            policy: RankSplit,
        })
    }
}

impl<F, S> InputFiltering<F, S> {
    /// Swap the score-to-label policy.
    pub fn with_policy<S2: ScoreToLabel>(self, policy: S2) -> InputFiltering<F, S2> {
        InputFiltering {
            filter: self.filter,
            defense_input_num: self.defense_input_num,
            policy,
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn defense_input_num(&self) -> usize {
        self.defense_input_num
    }
}

fn sorted(mut scores: Vec<f32>) -> Vec<f32> {
    scores.sort_by(f32::total_cmp);
    scores
}

impl<F, S: ScoreToLabel> InputFiltering<F, S> {
    /// Sorted clean and poisoned scores over up to `defense_input_num`
    /// correctly classified validation inputs.
    pub fn get_scores<B, M, A>(
        &mut self,
        ctx: &mut DefenseContext<'_, B, M, A>,
    ) -> DefenseResult<(Vec<f32>, Vec<f32>)>
    where
        B: Backend,
        M: ImageModel<B>,
        A: BackdoorAttack<B>,
        F: InputFilter<B>,
    {
        let mut clean_scores = Vec::with_capacity(self.defense_input_num);
        let mut poison_scores = Vec::with_capacity(self.defense_input_num);
        let mut remaining = self.defense_input_num;
        let mut iter = BatchIter::new(&ctx.splits.valid, LoaderConfig::eval(ctx.batch_size));
        while remaining > 0 {
            let Some(batch) = iter.next_batch::<B>(&ctx.device)? else {
                break;
            };
            let preds: Vec<i64> = ctx
                .model
                .forward(batch.input.clone())
                .argmax(1)
                .into_data()
                .iter::<i64>()
                .collect();
            let rows: Vec<usize> = preds
                .iter()
                .zip(&batch.labels)
                .enumerate()
                .filter(|(_, (pred, label))| pred == label)
                .map(|(i, _)| i)
                .take(remaining)
                .collect();
            let Some(kept) = batch.select(&rows) else {
                continue;
            };
            remaining -= kept.len();
            let poison_input = ctx.attack.badnet_mut().add_mark(kept.input.clone());
            clean_scores.extend(self.filter.check(ctx.model, kept.input, false)?);
            poison_scores.extend(self.filter.check(ctx.model, poison_input, true)?);
        }
        if remaining > 0 {
            tracing::warn!(
                wanted = self.defense_input_num,
                got = self.defense_input_num - remaining,
                "not enough correctly classified inputs"
            );
        }
        Ok((sorted(clean_scores), sorted(poison_scores)))
    }

    pub fn get_pred_labels(&self, clean_scores: &[f32], poison_scores: &[f32]) -> Vec<bool> {
        self.policy.score2label(clean_scores, poison_scores)
    }

    pub fn detect<B, M, A>(
        &mut self,
        ctx: &mut DefenseContext<'_, B, M, A>,
    ) -> DefenseResult<DetectionReport>
    where
        B: Backend,
        M: ImageModel<B>,
        A: BackdoorAttack<B>,
        F: InputFilter<B>,
    {
        ctx.prepare()?;
        let (clean_scores, poison_scores) = self.get_scores(ctx)?;
        let y_pred = self.get_pred_labels(&clean_scores, &poison_scores);
        let y_true = true_labels(clean_scores.len(), poison_scores.len());
        let metrics = ClassificationReport::from_labels(&y_true, &y_pred)?;
        metrics.print();
        Ok(DetectionReport {
            defense: self.filter.name().to_string(),
            metrics,
            clean_scores,
            poison_scores,
            y_pred,
        })
    }
}
