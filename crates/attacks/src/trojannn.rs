//! TrojanNN: BadNet with a trigger preprocessed to drive rarely used neurons
//! to a large activation.

use burn::module::{AutodiffModule, Module, Param};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use models::ImageModel;
use std::time::Instant;
use training::{scalar, TrainConfig};
use trojan_core::format_duration;
use trojan_dataset::{BatchIter, DatasetSplits, ImageSet, LoaderConfig};

use crate::badnet::{AttackReport, BadNet};
use crate::error::{config_err, AttackResult};
use crate::watermark::{blend_mark, tanh_func};

/// How the neurons to preprocess are chosen at `preprocess_layer`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NeuronSelection {
    /// Least mean absolute activation over the clean data.
    #[default]
    Activation,
    /// Least mean absolute outgoing weight in `next_layer`.
    NextLayerWeight { next_layer: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrojanNnConfig {
    pub preprocess_layer: String,
    pub target_value: f32,
    pub neuron_num: usize,
    pub neuron_lr: f64,
    pub neuron_epoch: usize,
    pub selection: NeuronSelection,
}

impl Default for TrojanNnConfig {
    fn default() -> Self {
        Self {
            preprocess_layer: "features".to_string(),
            target_value: 100.0,
            neuron_num: 2,
            neuron_lr: 0.1,
            neuron_epoch: 1000,
            selection: NeuronSelection::Activation,
        }
    }
}

#[derive(Module, Debug)]
struct MarkParam<B: Backend> {
    atanh_mark: Param<Tensor<B, 3>>,
}

/// Indices of the `k` smallest values, ties broken by lower index.
pub fn smallest_k(values: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

#[derive(Debug, Clone)]
pub struct TrojanNn<B: Backend> {
    cfg: TrojanNnConfig,
    badnet: BadNet<B>,
    neuron_idx: Option<Vec<usize>>,
}

impl<B: Backend> TrojanNn<B> {
    /// Fails when a knob is not positive or the mark cannot be preprocessed
    /// (random placement, or pixels not randomly initialized).
    pub fn new(cfg: TrojanNnConfig, badnet: BadNet<B>) -> AttackResult<Self> {
        if !cfg.target_value.is_finite() || cfg.target_value <= 0.0 {
            return Err(config_err(format!(
                "target_value must be positive, got {}",
                cfg.target_value
            )));
        }
        if cfg.neuron_num == 0 {
            return Err(config_err("neuron_num must be positive"));
        }
        if cfg.neuron_lr.is_nan() || cfg.neuron_lr <= 0.0 {
            return Err(config_err(format!(
                "neuron_lr must be positive, got {}",
                cfg.neuron_lr
            )));
        }
        if cfg.neuron_epoch == 0 {
            return Err(config_err("neuron_epoch must be positive"));
        }
        if badnet.mark().random_pos() {
            return Err(config_err(
                "TrojanNN needs a fixed mark position to target neurons",
            ));
        }
        if !badnet.mark().random_init() {
            return Err(config_err(
                "TrojanNN needs a randomly initialized mark",
            ));
        }
        Ok(Self {
            cfg,
            badnet,
            neuron_idx: None,
        })
    }

    pub fn name(&self) -> &'static str {
        "trojannn"
    }

    pub fn config(&self) -> &TrojanNnConfig {
        &self.cfg
    }

    pub fn badnet(&self) -> &BadNet<B> {
        &self.badnet
    }

    pub fn badnet_mut(&mut self) -> &mut BadNet<B> {
        &mut self.badnet
    }

    pub fn into_badnet(self) -> BadNet<B> {
        self.badnet
    }

    pub fn neuron_idx(&self) -> Option<&[usize]> {
        self.neuron_idx.as_deref()
    }

    /// Neurons selected by an earlier run, restored from its artifact.
    pub fn set_neuron_idx(&mut self, neuron_idx: Option<Vec<usize>>) {
        self.neuron_idx = neuron_idx;
    }

    pub fn get_filename(&self) -> String {
        self.badnet.get_filename().replacen("badnet", self.name(), 1)
    }

    /// Pick `neuron_num` neurons at `preprocess_layer`.
    pub fn select_neurons<M: ImageModel<B>>(
        &self,
        model: &M,
        clean: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> AttackResult<Vec<usize>> {
        let scores: Vec<f32> = match &self.cfg.selection {
            NeuronSelection::Activation => {
                let mut sums: Option<Tensor<B, 1>> = None;
                let mut count = 0usize;
                let mut iter = BatchIter::new(clean, LoaderConfig::eval(batch_size.max(1)));
                while let Some(batch) = iter.next_batch::<B>(device)? {
                    count += batch.len();
                    let act = model
                        .get_layer(batch.input, &self.cfg.preprocess_layer)?
                        .abs_channel_activation();
                    let k = act.dims()[1];
                    let batch_sum = act.sum_dim(0).reshape([k]);
                    sums = Some(match sums {
                        Some(s) => s + batch_sum,
                        None => batch_sum,
                    });
                }
                let sums = sums.ok_or_else(|| config_err("neuron selection needs clean data"))?;
                sums.div_scalar(count as f32)
                    .into_data()
                    .iter::<f32>()
                    .collect()
            }
            NeuronSelection::NextLayerWeight { next_layer } => model
                .named_weight(&format!("{next_layer}.weight"))?
                .abs_mean_per_input()
                .into_data()
                .iter::<f32>()
                .collect(),
        };
        if self.cfg.neuron_num > scores.len() {
            return Err(config_err(format!(
                "neuron_num {} exceeds the {} neurons of {}",
                self.cfg.neuron_num,
                scores.len(),
                self.cfg.preprocess_layer
            )));
        }
        Ok(smallest_k(&scores, self.cfg.neuron_num))
    }

    fn zeros_input(&self, device: &B::Device) -> Tensor<B, 4> {
        let [c, h, w] = self.badnet.mark().data_shape();
        Tensor::zeros([1, c, h, w], device)
    }

    fn neuron_tensor(neuron_idx: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
        let idx: Vec<i64> = neuron_idx.iter().map(|i| *i as i64).collect();
        Tensor::from_data(TensorData::new(idx, [neuron_idx.len()]), device)
    }

    fn chosen_activation<M: ImageModel<B>>(
        &self,
        model: &M,
        trigger_input: Tensor<B, 4>,
        idx: Tensor<B, 1, Int>,
    ) -> AttackResult<Tensor<B, 2>> {
        Ok(model
            .get_layer(trigger_input, &self.cfg.preprocess_layer)?
            .abs_channel_activation()
            .select(1, idx))
    }

    /// Mean absolute activation of `neuron_idx` for the trigger on a zero image.
    pub fn get_neuron_value<M: ImageModel<B>>(
        &self,
        model: &M,
        neuron_idx: &[usize],
    ) -> AttackResult<f32> {
        let mark = self.badnet.mark();
        let device = mark.mark().device();
        let trigger_input = blend_mark(
            self.zeros_input(&device),
            mark.mark().clone(),
            mark.offsets(),
            1.0,
        );
        let idx = Self::neuron_tensor(neuron_idx, &device);
        Ok(scalar(
            self.chosen_activation(model, trigger_input, idx)?.mean(),
        ))
    }

    /// Clean accuracy and attack success rate, plus the neuron value once
    /// neurons have been selected.
    pub fn validate_fn<M: ImageModel<B>>(
        &mut self,
        model: &M,
        valid: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> AttackResult<AttackReport> {
        if let Some(idx) = self.neuron_idx.clone() {
            println!("Neuron Value: {:.5}", self.get_neuron_value(model, &idx)?);
        }
        self.badnet.validate_fn(model, valid, batch_size, device)
    }
}

impl<B: AutodiffBackend> TrojanNn<B> {
    /// Optimize the mark pattern so the chosen neurons reach `target_value`
    /// on a zero image. Returns the per-epoch neuron value trace.
    pub fn preprocess_mark<M: ImageModel<B>>(
        &mut self,
        model: &M,
        neuron_idx: &[usize],
    ) -> AttackResult<Vec<f32>> {
        let before = self.get_neuron_value(model, neuron_idx)?;
        println!("Neuron Value Before Preprocessing: {before:.5}");

        let mark = self.badnet.mark();
        let device = mark.mark().device();
        let [c, _, _] = mark.data_shape();
        let (mh, mw) = mark.mark_size();
        let offset = mark.offsets();
        let alpha = mark.alpha_channel().detach();
        let zeros = self.zeros_input(&device);
        let idx = Self::neuron_tensor(neuron_idx, &device);

        let mut param = MarkParam {
            atanh_mark: Param::from_tensor(
                Tensor::<B, 3>::random([c, mh, mw], Distribution::Normal(0.0, 1.0), &device)
                    .require_grad(),
            ),
        };
        let mut optim = AdamConfig::new().init();
        let mut trace = Vec::with_capacity(self.cfg.neuron_epoch);
        let start = Instant::now();

        for _ in 0..self.cfg.neuron_epoch {
            let pattern = tanh_func(param.atanh_mark.val());
            let mark = Tensor::cat(vec![pattern, alpha.clone()], 0);
            let trigger_input = blend_mark(zeros.clone(), mark, offset, 1.0);
            let feats = self.chosen_activation(model, trigger_input, idx.clone())?;
            trace.push(scalar(feats.clone().detach().mean()));
            let loss = feats
                .sub_scalar(self.cfg.target_value)
                .powf_scalar(2.0)
                .sum();
            let grads = GradientsParams::from_grads(loss.backward(), &param);
            param = optim.step(self.cfg.neuron_lr, param, grads);
        }

        let pattern = tanh_func(param.atanh_mark.val()).detach();
        self.badnet.mark_mut().set_pattern(pattern)?;
        let after = self.get_neuron_value(model, neuron_idx)?;
        println!(
            "Neuron Value After Preprocessing: {after:.5} ({} epochs, {})",
            self.cfg.neuron_epoch,
            format_duration(start.elapsed().as_secs_f64())
        );
        Ok(trace)
    }

    /// Select neurons, preprocess the mark, then run the BadNet attack.
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
        let neuron_idx = self.select_neurons(&model, &splits.train, train_cfg.batch_size, device)?;
        tracing::info!(layer = %self.cfg.preprocess_layer, neurons = ?neuron_idx, "selected neurons");
        self.preprocess_mark(&model, &neuron_idx)?;
        self.neuron_idx = Some(neuron_idx.clone());
        let (model, report) = self.badnet.attack(model, splits, train_cfg, device)?;
        println!("Neuron Value: {:.5}", self.get_neuron_value(&model, &neuron_idx)?);
        Ok((model, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::badnet::BadNetConfig;
    use crate::watermark::{MarkConfig, Watermark};
    use crate::AttackError;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type B = Autodiff<NdArray<f32>>;

    fn badnet(random_pos: bool, random_init: bool) -> BadNet<B> {
        let device = Default::default();
        let mark = Watermark::new(
            [3, 8, 8],
            &MarkConfig {
                random_pos,
                random_init,
                seed: Some(0),
                ..Default::default()
            },
            &device,
        )
        .unwrap();
        BadNet::new(BadNetConfig::default(), mark).unwrap()
    }

    #[test]
    fn smallest_k_breaks_ties_by_index() {
        assert_eq!(smallest_k(&[3.0, 1.0, 1.0, 0.5], 3), vec![3, 1, 2]);
        assert_eq!(smallest_k(&[1.0], 4), vec![0]);
    }

    #[test]
    fn rejects_random_position() {
        let err = TrojanNn::new(TrojanNnConfig::default(), badnet(true, true)).unwrap_err();
        assert!(matches!(err, AttackError::Config(_)));
    }

    #[test]
    fn rejects_white_initialized_mark() {
        assert!(TrojanNn::new(TrojanNnConfig::default(), badnet(false, false)).is_err());
    }

    #[test]
    fn rejects_non_positive_knobs() {
        for cfg in [
            TrojanNnConfig {
                target_value: 0.0,
                ..Default::default()
            },
            TrojanNnConfig {
                neuron_num: 0,
                ..Default::default()
            },
            TrojanNnConfig {
                neuron_lr: -0.1,
                ..Default::default()
            },
            TrojanNnConfig {
                neuron_epoch: 0,
                ..Default::default()
            },
        ] {
            assert!(TrojanNn::new(cfg, badnet(false, true)).is_err());
        }
        assert!(TrojanNn::new(TrojanNnConfig::default(), badnet(false, true)).is_ok());
    }

    #[test]
    fn filename_uses_own_name() {
        let attack = TrojanNn::new(TrojanNnConfig::default(), badnet(false, true)).unwrap();
        assert_eq!(attack.get_filename(), "trojannn_tar0_alpha1.00_mark(3,3)");
    }
}
