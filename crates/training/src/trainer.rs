use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use models::ImageModel;
use std::time::Instant;
use trojan_core::{format_duration, output_iter, AverageMeter, MeterFormat};
use trojan_dataset::{Batch, BatchIter, DatasetResult, DatasetSplits, ImageSet, LoaderConfig};

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub lr: f64,
    pub batch_size: usize,
    pub seed: Option<u64>,
    /// Evaluate on the validation split every this many epochs (0 disables).
    pub validate_interval: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            lr: 1e-3,
            batch_size: 64,
            seed: None,
            validate_interval: 1,
        }
    }
}

/// Rewrites a training batch before the forward pass (e.g. to inject poisoned samples).
pub trait BatchTransform<B: Backend> {
    fn transform(&mut self, batch: Batch<B>) -> Batch<B>;
}

/// Leaves batches untouched.
pub struct Identity;

impl<B: Backend> BatchTransform<B> for Identity {
    fn transform(&mut self, batch: Batch<B>) -> Batch<B> {
        batch
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub loss: f64,
    /// Percentage in `[0, 100]`.
    pub acc: f64,
    pub count: usize,
}

/// First element of `tensor` as `f32`.
pub fn scalar<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f32 {
    tensor
        .into_data()
        .iter::<f32>()
        .next()
        .unwrap_or(0.0)
}

/// Rows of `logits` whose argmax equals the label.
pub fn correct_count<B: Backend>(logits: Tensor<B, 2>, labels: &[i64]) -> usize {
    logits
        .argmax(1)
        .into_data()
        .iter::<i64>()
        .zip(labels)
        .filter(|(pred, label)| pred == *label)
        .count()
}

pub fn train_classifier<B, M>(
    mut model: M,
    splits: &DatasetSplits,
    cfg: &TrainConfig,
    transform: &mut dyn BatchTransform<B>,
    device: &B::Device,
) -> anyhow::Result<M>
where
    B: AutodiffBackend,
    M: ImageModel<B> + AutodiffModule<B>,
{
    if splits.train.is_empty() {
        anyhow::bail!("training split is empty");
    }
    let mut optim = AdamConfig::new().init();
    let mut losses = AverageMeter::new("Loss", MeterFormat::Scientific(4));
    let mut acc = AverageMeter::new(
        "Acc",
        MeterFormat::Fixed {
            width: 6,
            precision: 2,
        },
    );

    for epoch in 0..cfg.epochs {
        losses.reset();
        acc.reset();
        let epoch_start = Instant::now();
        let loader = LoaderConfig {
            batch_size: cfg.batch_size.max(1),
            shuffle: true,
            seed: cfg.seed.map(|s| s.wrapping_add(epoch as u64)),
            drop_last: false,
        };
        let mut iter = BatchIter::new(&splits.train, loader);
        while let Some(batch) = iter.next_batch::<B>(device)? {
            let batch = transform.transform(batch);
            let n = batch.len();
            let logits = model.forward(batch.input.clone());
            let correct = correct_count(logits.clone(), &batch.labels);
            let loss = model.criterion(logits, batch.label.clone());
            let loss_detached = loss.clone().detach();
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(cfg.lr, model, grads);

            losses.update(scalar(loss_detached) as f64, n);
            acc.update(100.0 * correct as f64 / n.max(1) as f64, n);
        }
        println!(
            "Epoch: {} Loss: {:.4}, Acc: {:.2}, Time: {}",
            output_iter(epoch + 1, cfg.epochs),
            losses.avg,
            acc.avg,
            format_duration(epoch_start.elapsed().as_secs_f64())
        );
        if cfg.validate_interval > 0 && (epoch + 1) % cfg.validate_interval == 0 {
            let res = evaluate(&model, &splits.valid, cfg.batch_size, &mut Identity, device)?;
            println!("    Validate Clean Loss: {:.4}, Acc: {:.2}", res.loss, res.acc);
        }
    }
    Ok(model)
}

/// Mean loss and accuracy of `model` on `set`, after `transform` is applied per batch.
pub fn evaluate<B, M>(
    model: &M,
    set: &ImageSet,
    batch_size: usize,
    transform: &mut dyn BatchTransform<B>,
    device: &B::Device,
) -> DatasetResult<EvalResult>
where
    B: Backend,
    M: ImageModel<B>,
{
    let mut losses = AverageMeter::new("Loss", MeterFormat::default());
    let mut acc = AverageMeter::new("Acc", MeterFormat::default());
    let mut iter = BatchIter::new(set, LoaderConfig::eval(batch_size.max(1)));
    while let Some(batch) = iter.next_batch::<B>(device)? {
        let batch = transform.transform(batch);
        let n = batch.len();
        if n == 0 {
            continue;
        }
        let logits = model.forward(batch.input.clone());
        let correct = correct_count(logits.clone(), &batch.labels);
        let loss = model.criterion(logits, batch.label.clone());
        losses.update(scalar(loss) as f64, n);
        acc.update(100.0 * correct as f64 / n as f64, n);
    }
    Ok(EvalResult {
        loss: losses.avg,
        acc: acc.avg,
        count: acc.count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn correct_count_uses_argmax() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_data(
            TensorData::new(vec![0.1f32, 0.9, 0.8, 0.2, 0.3, 0.7], [3, 2]),
            &device,
        );
        assert_eq!(correct_count(logits, &[1, 0, 0]), 2);
    }

    #[test]
    fn scalar_reads_first_element() {
        let device = Default::default();
        let t = Tensor::<B, 1>::from_floats([2.5f32, 1.0], &device);
        assert_eq!(scalar(t), 2.5);
    }
}
