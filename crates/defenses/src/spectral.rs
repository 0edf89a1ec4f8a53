//! Spectral signatures: poisoned samples of a class leave a trace along the
//! top singular direction of its centered feature matrix.

use burn::tensor::backend::Backend;
use models::ImageModel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use trojan_dataset::{BatchIter, ImageSet, LoaderConfig};

use crate::error::{DefenseError, DefenseResult};
use crate::training_filtering::TrainingFilter;

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralConfig {
    /// Layer whose channel activations form the representation.
    pub layer: String,
    /// Flag `ceil(eps_multiplier * poison_fraction * n)` samples per class.
    pub eps_multiplier: f64,
    pub power_iters: usize,
    pub seed: Option<u64>,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            layer: "features".to_string(),
            eps_multiplier: 1.5,
            power_iters: 100,
            seed: None,
        }
    }
}

pub struct SpectralSignature {
    cfg: SpectralConfig,
    rng: StdRng,
}

impl SpectralSignature {
    pub fn new(cfg: SpectralConfig) -> DefenseResult<Self> {
        if cfg.power_iters == 0 {
            return Err(DefenseError::Config("power_iters must be positive".into()));
        }
        if cfg.eps_multiplier.is_nan() || cfg.eps_multiplier <= 0.0 {
            return Err(DefenseError::Config(format!(
                "eps_multiplier must be positive, got {}",
                cfg.eps_multiplier
            )));
        }
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Ok(Self { cfg, rng })
    }

    pub fn config(&self) -> &SpectralConfig {
        &self.cfg
    }

    fn representation<B: Backend, M: ImageModel<B>>(
        &self,
        model: &M,
        set: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> DefenseResult<(Vec<f64>, usize)> {
        let mut rows = Vec::new();
        let mut dim = 0;
        let mut iter = BatchIter::new(set, LoaderConfig::eval(batch_size.max(1)));
        while let Some(batch) = iter.next_batch::<B>(device)? {
            let act = model
                .get_layer(batch.input, &self.cfg.layer)?
                .channel_activation();
            dim = act.dims()[1];
            rows.extend(act.into_data().iter::<f32>().map(f64::from));
        }
        Ok((rows, dim))
    }

    /// Squared projection of each centered row onto the top right-singular
    /// vector of the `[n, dim]` row-major matrix.
    pub fn outlier_scores(&mut self, rows: &[f64], dim: usize) -> Vec<f64> {
        if dim == 0 || rows.is_empty() {
            return Vec::new();
        }
        let n = rows.len() / dim;
        let mut mean = vec![0.0; dim];
        for row in rows.chunks_exact(dim) {
            for (m, x) in mean.iter_mut().zip(row) {
                *m += x / n as f64;
            }
        }
        let centered: Vec<f64> = rows
            .chunks_exact(dim)
            .flat_map(|row| row.iter().zip(&mean).map(|(x, m)| x - m))
            .collect();

        let mut v: Vec<f64> = (0..dim).map(|_| self.rng.random_range(-1.0..1.0)).collect();
        normalize(&mut v);
        for _ in 0..self.cfg.power_iters {
            // v <- X^T X v
            let xv: Vec<f64> = centered.chunks_exact(dim).map(|row| dot(row, &v)).collect();
            let mut next = vec![0.0; dim];
            for (row, p) in centered.chunks_exact(dim).zip(&xv) {
                for (acc, x) in next.iter_mut().zip(row) {
                    *acc += x * p;
                }
            }
            if !normalize(&mut next) {
                break;
            }
            v = next;
        }
        centered
            .chunks_exact(dim)
            .map(|row| dot(row, &v).powi(2))
            .collect()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scale to unit length; false when the vector is (near) zero.
fn normalize(v: &mut [f64]) -> bool {
    let norm = dot(v, v).sqrt();
    if norm < 1e-12 {
        return false;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    true
}

impl<B: Backend> TrainingFilter<B> for SpectralSignature {
    fn name(&self) -> &'static str {
        "spectral"
    }

    fn get_pred_labels<M: ImageModel<B>>(
        &mut self,
        model: &M,
        clean: &ImageSet,
        poison: &ImageSet,
        batch_size: usize,
        device: &B::Device,
    ) -> DefenseResult<(Vec<f32>, Vec<bool>)> {
        let combined = clean.clone().concat(poison)?;
        let total = combined.len();
        let poison_fraction = if total == 0 {
            0.0
        } else {
            poison.len() as f64 / total as f64
        };
        let mut scores = vec![0.0f32; total];
        let mut y_pred = vec![false; total];
        for class in 0..combined.num_classes() as i64 {
            let idx: Vec<usize> = combined
                .labels()
                .iter()
                .enumerate()
                .filter(|(_, label)| **label == class)
                .map(|(i, _)| i)
                .collect();
            if idx.is_empty() {
                continue;
            }
            let subset = combined.subset(&idx)?;
            let (rows, dim) = self.representation(model, &subset, batch_size, device)?;
            let class_scores = self.outlier_scores(&rows, dim);
            let flag_num = ((self.cfg.eps_multiplier * poison_fraction * idx.len() as f64).ceil()
                as usize)
                .min(idx.len());
            let mut order: Vec<usize> = (0..class_scores.len()).collect();
            order.sort_by(|&a, &b| class_scores[b].total_cmp(&class_scores[a]));
            for &j in order.iter().take(flag_num) {
                y_pred[idx[j]] = true;
            }
            for (j, s) in class_scores.iter().enumerate() {
                scores[idx[j]] = *s as f32;
            }
            tracing::debug!(class, samples = idx.len(), flagged = flag_num, "spectral class");
        }
        Ok((scores, y_pred))
    }
}
