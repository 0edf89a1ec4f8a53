use burn::tensor::backend::Backend;
use clap::Parser;
use models::{load_checkpoint, ImageModel, MlpNet, MlpNetConfig, Net, NetConfig};
use trojan_core::ClassificationReport;
use trojan_dataset::{generate, BatchIter, LoaderConfig, SyntheticConfig};
use training::util::{default_checkpoint, BackendKind, ModelKind};
use training::TrainBackend;

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a Net/MlpNet checkpoint on the synthetic validation split"
)]
struct Args {
    /// Model to evaluate.
    #[arg(long, value_enum, default_value_t = ModelKind::Net)]
    model: ModelKind,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    #[arg(long, default_value_t = 10)]
    num_classes: usize,
    #[arg(long, default_value_t = 16)]
    image_size: usize,
    #[arg(long, default_value_t = 3)]
    channels: usize,
    /// Validation samples per class.
    #[arg(long, default_value_t = 16)]
    valid_per_class: usize,
    /// Seed of the synthetic dataset (match the training run).
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Checkpoint path to load (defaults by model).
    #[arg(long)]
    checkpoint: Option<String>,
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
}

fn predict<M: ImageModel<TrainBackend>>(
    model: &M,
    set: &trojan_dataset::ImageSet,
    batch_size: usize,
) -> anyhow::Result<(Vec<i64>, Vec<i64>)> {
    let device = <TrainBackend as Backend>::Device::default();
    let mut y_true = Vec::with_capacity(set.len());
    let mut y_pred = Vec::with_capacity(set.len());
    let mut iter = BatchIter::new(set, LoaderConfig::eval(batch_size.max(1)));
    while let Some(batch) = iter.next_batch::<TrainBackend>(&device)? {
        let preds = model.forward(batch.input).argmax(1);
        y_pred.extend(preds.into_data().iter::<i64>());
        y_true.extend(batch.labels);
    }
    Ok((y_true, y_pred))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    training::util::validate_backend_choice(args.backend)?;

    let data_shape = [args.channels, args.image_size, args.image_size];
    let splits = generate(&SyntheticConfig {
        data_shape,
        num_classes: args.num_classes,
        train_per_class: 1,
        valid_per_class: args.valid_per_class,
        seed: args.seed,
        ..Default::default()
    })?;
    let device = <TrainBackend as Backend>::Device::default();
    let ckpt = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| default_checkpoint(args.model).to_string());

    let (y_true, y_pred) = match args.model {
        ModelKind::Net => {
            let fresh = Net::<TrainBackend>::new(
                NetConfig {
                    data_shape,
                    num_classes: args.num_classes,
                    ..Default::default()
                },
                &device,
            );
            let model = load_checkpoint(fresh, &ckpt, &device)?;
            predict(&model, &splits.valid, args.batch_size)?
        }
        ModelKind::Mlp => {
            let fresh = MlpNet::<TrainBackend>::new(
                MlpNetConfig {
                    data_shape,
                    num_classes: args.num_classes,
                    ..Default::default()
                },
                &device,
            );
            let model = load_checkpoint(fresh, &ckpt, &device)?;
            predict(&model, &splits.valid, args.batch_size)?
        }
    };

    let correct = y_true.iter().zip(&y_pred).filter(|(t, p)| t == p).count();
    println!(
        "Eval complete: acc={:.2}% ({} / {}) checkpoint={}",
        100.0 * correct as f64 / y_true.len().max(1) as f64,
        correct,
        y_true.len(),
        ckpt
    );
    // One-vs-rest report for class 0.
    let truth: Vec<bool> = y_true.iter().map(|l| *l == 0).collect();
    let pred: Vec<bool> = y_pred.iter().map(|l| *l == 0).collect();
    ClassificationReport::from_labels(&truth, &pred)?.print();
    Ok(())
}
