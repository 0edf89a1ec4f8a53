//! STRIP: a triggered input keeps its (target) prediction when blended with
//! random clean images, so its prediction entropy stays low.

use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use models::ImageModel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use trojan_dataset::ImageSet;

use crate::error::{DefenseError, DefenseResult};
use crate::input_filtering::InputFilter;

#[derive(Debug, Clone, PartialEq)]
pub struct StripConfig {
    /// Weight of the superimposed clean image.
    pub strip_alpha: f32,
    /// Clean images blended with every input.
    pub fusion_num: usize,
    pub seed: Option<u64>,
}

impl Default for StripConfig {
    fn default() -> Self {
        Self {
            strip_alpha: 0.5,
            fusion_num: 100,
            seed: None,
        }
    }
}

pub struct Strip {
    cfg: StripConfig,
    pool: ImageSet,
    rng: StdRng,
}

impl Strip {
    /// `pool`: clean images drawn for superimposition.
    pub fn new(cfg: StripConfig, pool: ImageSet) -> DefenseResult<Self> {
        if pool.is_empty() {
            return Err(DefenseError::Config("STRIP needs a non-empty clean pool".into()));
        }
        if cfg.fusion_num == 0 {
            return Err(DefenseError::Config("fusion_num must be positive".into()));
        }
        if !(cfg.strip_alpha > 0.0 && cfg.strip_alpha <= 1.0) {
            return Err(DefenseError::Config(format!(
                "strip_alpha must lie in (0, 1], got {}",
                cfg.strip_alpha
            )));
        }
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Ok(Self { cfg, pool, rng })
    }

    pub fn config(&self) -> &StripConfig {
        &self.cfg
    }

    pub fn superimpose<B: Backend>(&self, input: Tensor<B, 4>, other: Tensor<B, 4>) -> Tensor<B, 4> {
        input + other.mul_scalar(self.cfg.strip_alpha)
    }

    fn draw<B: Backend>(&mut self, n: usize, device: &B::Device) -> DefenseResult<Tensor<B, 4>> {
        let picks: Vec<usize> = (0..n)
            .map(|_| self.rng.random_range(0..self.pool.len()))
            .collect();
        let subset = self.pool.subset(&picks)?;
        let [c, h, w] = subset.data_shape();
        Ok(Tensor::from_data(
            TensorData::new(subset.inputs().to_vec(), [n, c, h, w]),
            device,
        ))
    }
}

/// Prediction entropy per row, `[N]`.
pub fn prediction_entropy<B: Backend, M: ImageModel<B>>(model: &M, input: Tensor<B, 4>) -> Tensor<B, 1> {
    let probs = softmax(model.forward(input), 1);
    let [n, _] = probs.dims();
    (probs.clone() * probs.clamp_min(1e-12).log())
        .sum_dim(1)
        .neg()
        .reshape([n])
}

impl<B: Backend> InputFilter<B> for Strip {
    fn name(&self) -> &'static str {
        "strip"
    }

    /// Negated mean entropy over `fusion_num` superimpositions.
    fn check<M: ImageModel<B>>(
        &mut self,
        model: &M,
        input: Tensor<B, 4>,
        _poison: bool,
    ) -> DefenseResult<Vec<f32>> {
        let n = input.dims()[0];
        let device = input.device();
        let mut total = Tensor::<B, 1>::zeros([n], &device);
        for _ in 0..self.cfg.fusion_num {
            let other = self.draw::<B>(n, &device)?;
            let mixed = self.superimpose(input.clone(), other);
            total = total + prediction_entropy(model, mixed);
        }
        Ok(total
            .div_scalar(self.cfg.fusion_num as f32)
            .neg()
            .into_data()
            .iter::<f32>()
            .collect())
    }
}
