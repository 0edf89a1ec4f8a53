//! Model inspection: reverse-engineer a minimal trigger for every class and
//! flag the class whose trigger is abnormally small.

use attacks::{blend_mark, tanh_func, BackdoorAttack, Watermark};
use burn::module::{Module, Param};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use models::ImageModel;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use training::{correct_count, evaluate, scalar, BatchTransform};
use trojan_core::metric::lower_median;
use trojan_core::{format_duration, mask_jaccard, normalize_mad, output_iter, AverageMeter, MadSide, MeterFormat};
use trojan_dataset::{Batch, BatchIter, ImageSet, LoaderConfig};

use crate::backdoor::{DefenseContext, RealMark};
use crate::cache::{archive_path, MarkArchive};
use crate::early_stop::NeverStop;
use crate::error::{artifact_err, DefenseError, DefenseResult};

/// Class whose anomaly index exceeds this is reported as backdoored.
pub const ANOMALY_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct InspectionConfig {
    pub remask_epoch: usize,
    pub remask_lr: f64,
    pub init_cost: f64,
    /// Adam `(beta_1, beta_2)`.
    pub betas: (f32, f32),
    pub batch_size: usize,
    /// Where per-class archives are written.
    pub cache_dir: PathBuf,
    pub seed: Option<u64>,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            remask_epoch: 10,
            remask_lr: 0.1,
            init_cost: 1e-3,
            betas: (0.5, 0.9),
            batch_size: 64,
            cache_dir: PathBuf::from("results"),
            seed: None,
        }
    }
}

/// Epoch averages of the mark optimization. `acc` is a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub acc: f64,
    pub norm: f64,
    pub entropy: f64,
}

/// Per-defense customization of the mark optimization loop.
pub trait InspectionHooks {
    fn name(&self) -> &'static str {
        "model_inspection"
    }

    /// Called before optimizing the mark of `label`.
    fn before_loop_fn(&mut self, _label: i64) {}

    fn check_early_stop(&mut self, _stats: &EpochStats) -> bool {
        false
    }

    /// Weight of the mask norm in the loss.
    fn cost(&self, init_cost: f64) -> f64 {
        init_cost
    }

    fn after_epoch(&mut self, _stats: &EpochStats) {}
}

/// Best mark found for one class.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkCandidate {
    pub label: i64,
    /// `(C + 1, H, W)`, channel-major; the last channel is the mask.
    pub mark: Vec<f32>,
    pub shape: [usize; 3],
    /// Cross entropy at the snapshot.
    pub loss: f64,
    /// L1 norm of the snapshot mask.
    pub norm: f64,
    /// Attack success rate of the mark on validation data, percent.
    pub asr: f64,
}

impl MarkCandidate {
    /// The `H * W` mask channel.
    pub fn mask(&self) -> &[f32] {
        let [_, h, w] = self.shape;
        &self.mark[self.mark.len() - h * w..]
    }

    /// L1 norm of the stored mask channel.
    pub fn mask_l1(&self) -> f64 {
        l1(self.mask())
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(self.mark.clone(), self.shape), device)
    }
}

fn l1(values: &[f32]) -> f64 {
    values.iter().map(|v| f64::from(v.abs())).sum()
}

#[derive(Debug, Clone, Default)]
pub struct InspectionResult {
    pub candidates: Vec<MarkCandidate>,
}

impl InspectionResult {
    pub fn mask_norms(&self) -> Vec<f64> {
        self.candidates.iter().map(MarkCandidate::mask_l1).collect()
    }

    pub fn losses(&self) -> Vec<f64> {
        self.candidates.iter().map(|c| c.loss).collect()
    }

    pub fn mark_list(&self) -> Vec<f32> {
        self.candidates.iter().flat_map(|c| c.mark.iter().copied()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub defense: String,
    pub attack: String,
    pub target_class: i64,
    pub mask_norms: Vec<f64>,
    pub norm_mad: Vec<f64>,
    pub losses: Vec<f64>,
    pub loss_mad: Vec<f64>,
    /// Class with the largest low-side anomaly index of its mask norm.
    pub suspect_class: i64,
    pub anomaly_index: f64,
    pub flagged: bool,
    /// Overlap of the target-class mask with the real trigger mask.
    pub jaccard: Option<f32>,
    pub archive: PathBuf,
}

/// Anomaly index of each value counted only below the median.
pub fn low_side_anomaly(values: &[f64]) -> Vec<f64> {
    let Some(med) = lower_median(values) else {
        return Vec::new();
    };
    normalize_mad(values, MadSide::Single)
        .into_iter()
        .zip(values)
        .map(|(score, v)| if *v <= med { score } else { 0.0 })
        .collect()
}

#[derive(Module, Debug)]
struct MaskParam<B: Backend> {
    atanh_mark: Param<Tensor<B, 3>>,
}

/// Applies a full-frame candidate mark and retargets every row.
struct CandidateTrigger<B: Backend> {
    mark: Tensor<B, 3>,
    target: i64,
}

impl<B: Backend> BatchTransform<B> for CandidateTrigger<B> {
    fn transform(&mut self, batch: Batch<B>) -> Batch<B> {
        Batch {
            input: blend_mark(batch.input, self.mark.clone(), (0, 0), 1.0),
            ..batch
        }
        .with_target(self.target)
    }
}

pub struct ModelInspection<H = NeverStop> {
    cfg: InspectionConfig,
    hooks: H,
}

impl ModelInspection<NeverStop> {
    pub fn new(cfg: InspectionConfig) -> DefenseResult<Self> {
        Self::with_hooks(cfg, NeverStop)
    }
}

impl<H: InspectionHooks> ModelInspection<H> {
    pub fn with_hooks(cfg: InspectionConfig, hooks: H) -> DefenseResult<Self> {
        if cfg.remask_epoch == 0 {
            return Err(DefenseError::Config("remask_epoch must be at least 1".into()));
        }
        if cfg.remask_lr.is_nan() || cfg.remask_lr <= 0.0 {
            return Err(DefenseError::Config(format!(
                "remask_lr must be positive, got {}",
                cfg.remask_lr
            )));
        }
        if cfg.batch_size == 0 {
            return Err(DefenseError::Config("batch_size must be positive".into()));
        }
        Ok(Self { cfg, hooks })
    }

    pub fn name(&self) -> &'static str {
        self.hooks.name()
    }

    pub fn config(&self) -> &InspectionConfig {
        &self.cfg
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn archive_path<B, M, A>(&self, ctx: &DefenseContext<'_, B, M, A>) -> PathBuf
    where
        B: Backend,
        M: ImageModel<B>,
        A: BackdoorAttack<B>,
    {
        archive_path(
            &self.cfg.cache_dir,
            ctx.attack.name(),
            self.name(),
            ctx.target_class(),
        )
    }

    /// Restore the mark of `target_class` from an archive as a full-frame mark.
    pub fn load<B: Backend>(
        &self,
        path: &Path,
        target_class: i64,
        device: &B::Device,
    ) -> DefenseResult<Watermark<B>> {
        let archive = MarkArchive::load(path)?;
        let values = usize::try_from(target_class)
            .ok()
            .and_then(|i| archive.mark(i))
            .ok_or_else(|| {
                artifact_err(
                    path,
                    format!("no mark for class {target_class} among {}", archive.len()),
                )
            })?;
        let [c1, h, w] = archive.mark_shape;
        if c1 < 2 {
            return Err(artifact_err(path, format!("mark shape {:?}", archive.mark_shape)));
        }
        let mut mark = Watermark::full_frame([c1 - 1, h, w], device);
        mark.set_mark(Tensor::from_data(
            TensorData::new(values.to_vec(), archive.mark_shape),
            device,
        ))?;
        tracing::info!(path = %path.display(), target_class, "mark loaded");
        Ok(mark)
    }
}

impl<H: InspectionHooks> ModelInspection<H> {
    /// Optimize a full-frame mark that sends `train` to `label`, keeping the
    /// epoch with the smallest mask norm.
    pub fn optimize_mark<B, M>(
        &mut self,
        model: &M,
        label: i64,
        train: &ImageSet,
        valid: &ImageSet,
        device: &B::Device,
    ) -> DefenseResult<(MarkCandidate, Vec<EpochStats>)>
    where
        B: AutodiffBackend,
        M: ImageModel<B>,
    {
        if train.is_empty() {
            return Err(DefenseError::Config("mark optimization needs training data".into()));
        }
        self.hooks.before_loop_fn(label);
        if let Some(seed) = self.cfg.seed {
            B::seed(seed.wrapping_add(label as u64));
        }
        let [c, h, w] = model.data_shape();
        let shape = [c + 1, h, w];
        let mut param = MaskParam {
            atanh_mark: Param::from_tensor(
                Tensor::<B, 3>::random(shape, Distribution::Normal(0.0, 1.0), device).require_grad(),
            ),
        };
        let (beta_1, beta_2) = self.cfg.betas;
        let mut optim = AdamConfig::new()
            .with_beta_1(beta_1)
            .with_beta_2(beta_2)
            .init();

        let mut loss_m = AverageMeter::new("Loss", MeterFormat::Fixed { width: 7, precision: 3 });
        let mut acc_m = AverageMeter::new("Acc", MeterFormat::Fixed { width: 7, precision: 3 });
        let mut norm_m = AverageMeter::new("Norm", MeterFormat::Fixed { width: 7, precision: 3 });
        let mut entropy_m = AverageMeter::new("Entropy", MeterFormat::Fixed { width: 7, precision: 3 });
        let mut best: Option<(Vec<f32>, f64, f64)> = None;
        let mut norm_best = f64::INFINITY;
        let mut history = Vec::with_capacity(self.cfg.remask_epoch);
        let start = Instant::now();

        for epoch in 0..self.cfg.remask_epoch {
            loss_m.reset();
            acc_m.reset();
            norm_m.reset();
            entropy_m.reset();
            let cost = self.hooks.cost(self.cfg.init_cost);
            let mut iter = BatchIter::new(
                train,
                LoaderConfig {
                    batch_size: self.cfg.batch_size,
                    shuffle: true,
                    seed: self.cfg.seed.map(|s| s.wrapping_add(epoch as u64)),
                    drop_last: false,
                },
            );
            while let Some(batch) = iter.next_batch::<B>(device)? {
                let n = batch.len();
                if n == 0 {
                    continue;
                }
                let mark = tanh_func(param.atanh_mark.val());
                let input = blend_mark(batch.input, mark.clone(), (0, 0), 1.0);
                let target = Tensor::<B, 1, Int>::full([n], label, device);
                let logits = model.forward(input);
                let correct = correct_count(logits.clone(), &vec![label; n]);
                let entropy = model.criterion(logits, target);
                let norm = mark.slice([c..c + 1, 0..h, 0..w]).sum();
                let loss = entropy.clone() + norm.clone().mul_scalar(cost);

                acc_m.update(100.0 * correct as f64 / n as f64, n);
                entropy_m.update(scalar(entropy.detach()) as f64, n);
                norm_m.update(scalar(norm.detach()) as f64, n);
                loss_m.update(scalar(loss.clone().detach()) as f64, n);

                let grads = GradientsParams::from_grads(loss.backward(), &param);
                param = optim.step(self.cfg.remask_lr, param, grads);
            }

            let stats = EpochStats {
                epoch: epoch + 1,
                loss: loss_m.avg,
                acc: acc_m.avg,
                norm: norm_m.avg,
                entropy: entropy_m.avg,
            };
            println!(
                "{}  {}  {}  {}  {}",
                output_iter(epoch + 1, self.cfg.remask_epoch),
                loss_m,
                acc_m,
                norm_m,
                entropy_m
            );
            let snapshot: Vec<f32> = tanh_func(param.atanh_mark.val())
                .detach()
                .into_data()
                .iter::<f32>()
                .collect();
            let snapshot_norm = l1(&snapshot[c * h * w..]);
            // A NaN first epoch stays the baseline: nothing compares below NaN.
            if best.is_none() || snapshot_norm < norm_best {
                norm_best = snapshot_norm;
                best = Some((snapshot, snapshot_norm, stats.entropy));
            }
            self.hooks.after_epoch(&stats);
            history.push(stats);
            if self.hooks.check_early_stop(&stats) {
                println!("early stop");
                break;
            }
        }

        let Some((mark, norm, loss)) = best else {
            return Err(DefenseError::Config("mark optimization ran no epoch".into()));
        };
        let mut candidate = MarkCandidate {
            label,
            mark,
            shape,
            loss,
            norm,
            asr: 0.0,
        };
        let others = valid.filter_labels(|l| l != label);
        if !others.is_empty() {
            let mut trigger = CandidateTrigger {
                mark: candidate.to_tensor::<B>(device),
                target: label,
            };
            let res = evaluate(model, &others, self.cfg.batch_size, &mut trigger, device)?;
            candidate.asr = res.acc;
        }
        println!(
            "Class {label} mark: norm {:.3}, loss {:.3}, attack acc {:.2} ({})",
            candidate.norm,
            candidate.loss,
            candidate.asr,
            format_duration(start.elapsed().as_secs_f64())
        );
        Ok((candidate, history))
    }

    /// Sweep every class, persisting the candidates after each one.
    pub fn get_mark_loss_list<B, M, A>(
        &mut self,
        ctx: &mut DefenseContext<'_, B, M, A>,
        real: &RealMark<B>,
    ) -> DefenseResult<InspectionResult>
    where
        B: AutodiffBackend,
        M: ImageModel<B>,
        A: BackdoorAttack<B>,
    {
        let num_classes = ctx.model.num_classes();
        let path = self.archive_path(ctx);
        let real_mask: Vec<f32> = real.mask.clone().into_data().iter::<f32>().collect();
        let (mh, mw) = real.mark_size;
        let mut result = InspectionResult::default();
        for label in 0..num_classes {
            println!("Class: {}", output_iter(label + 1, num_classes));
            let (candidate, _) = self.optimize_mark(
                ctx.model,
                label as i64,
                &ctx.splits.train,
                &ctx.splits.valid,
                &ctx.device,
            )?;
            if !real.random_pos {
                let overlap = mask_jaccard(candidate.mask(), &real_mask, mh * mw)?;
                println!("Jaccard index: {overlap:.3}");
            }
            result.candidates.push(candidate);
            let archive = MarkArchive {
                attack: ctx.attack.name().to_string(),
                defense: self.name().to_string(),
                target_class: ctx.target_class(),
                mark_shape: result.candidates[0].shape,
                mark_list: result.mark_list(),
                loss_list: result.losses().iter().map(|l| *l as f32).collect(),
            };
            archive.save(&path)?;
            println!("Defense results saved at: {}", path.display());
        }
        Ok(result)
    }

    pub fn detect<B, M, A>(
        &mut self,
        ctx: &mut DefenseContext<'_, B, M, A>,
    ) -> DefenseResult<InspectionReport>
    where
        B: AutodiffBackend,
        M: ImageModel<B>,
        A: BackdoorAttack<B>,
    {
        let real = ctx.prepare()?;
        let result = self.get_mark_loss_list(ctx, &real)?;
        let mask_norms = result.mask_norms();
        let losses = result.losses();
        let norm_mad = normalize_mad(&mask_norms, MadSide::Single);
        let loss_mad = normalize_mad(&losses, MadSide::Single);
        println!("mask norms: {mask_norms:.3?}");
        println!("mask MAD: {norm_mad:.3?}");
        println!("loss: {losses:.3?}");
        println!("loss MAD: {loss_mad:.3?}");

        let anomaly = low_side_anomaly(&mask_norms);
        let (suspect, anomaly_index) = anomaly
            .iter()
            .enumerate()
            .fold((0usize, f64::NEG_INFINITY), |acc, (i, v)| {
                if *v > acc.1 {
                    (i, *v)
                } else {
                    acc
                }
            });
        let flagged = anomaly_index > ANOMALY_THRESHOLD;

        let target = ctx.target_class();
        let jaccard = match usize::try_from(target).ok().and_then(|t| result.candidates.get(t)) {
            Some(candidate) if !real.random_pos => {
                let mut mark = Watermark::<B>::full_frame(ctx.model.data_shape(), &ctx.device);
                mark.set_mark(candidate.to_tensor(&ctx.device))?;
                let found: Vec<f32> = mark.get_mask().into_data().iter::<f32>().collect();
                let real_mask: Vec<f32> = real.mask.clone().into_data().iter::<f32>().collect();
                let (mh, mw) = real.mark_size;
                let overlap = mask_jaccard(&found, &real_mask, mh * mw)?;
                println!("Jaccard index: {overlap:.3}");
                Some(overlap)
            }
            _ => None,
        };
        if flagged {
            tracing::warn!(class = suspect, anomaly_index, "backdoored class detected");
        }
        Ok(InspectionReport {
            defense: self.name().to_string(),
            attack: ctx.attack.name().to_string(),
            target_class: target,
            mask_norms,
            norm_mad,
            losses,
            loss_mad,
            suspect_class: suspect as i64,
            anomaly_index: anomaly_index.max(0.0),
            flagged,
            jaccard,
            archive: self.archive_path(ctx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_side_ignores_large_norms() {
        let idx = low_side_anomaly(&[10.0, 11.0, 9.0, 10.5, 2.0, 30.0]);
        assert_eq!(idx.len(), 6);
        assert_eq!(idx[5], 0.0);
        assert!(idx[4] > ANOMALY_THRESHOLD);
        assert!(idx[4] > idx[2]);
    }

    #[test]
    fn candidate_mask_is_last_channel() {
        let candidate = MarkCandidate {
            label: 0,
            mark: vec![0.1, 0.2, 0.3, 0.4, 1.0, 0.0, 0.5, 0.25],
            shape: [2, 2, 2],
            loss: 0.0,
            norm: 1.75,
            asr: 0.0,
        };
        assert_eq!(candidate.mask(), &[1.0, 0.0, 0.5, 0.25]);
        assert!((candidate.mask_l1() - 1.75).abs() < 1e-9);
    }

    #[test]
    fn result_norms_come_from_stored_masks() {
        let result = InspectionResult {
            candidates: vec![
                MarkCandidate {
                    label: 0,
                    mark: vec![0.9, 0.9, 0.2, 0.2],
                    shape: [2, 1, 2],
                    loss: 0.5,
                    norm: 99.0,
                    asr: 0.0,
                },
                MarkCandidate {
                    label: 1,
                    mark: vec![0.0, 0.0, 1.0, 0.5],
                    shape: [2, 1, 2],
                    loss: 0.25,
                    norm: 0.0,
                    asr: 0.0,
                },
            ],
        };
        let norms = result.mask_norms();
        assert!((norms[0] - 0.4).abs() < 1e-6);
        assert!((norms[1] - 1.5).abs() < 1e-6);
        assert_eq!(result.losses(), vec![0.5, 0.25]);
    }

    #[test]
    fn zero_epochs_rejected() {
        let cfg = InspectionConfig {
            remask_epoch: 0,
            ..Default::default()
        };
        assert!(ModelInspection::new(cfg).is_err());
    }
}
