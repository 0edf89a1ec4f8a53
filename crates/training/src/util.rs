use burn::module::AutodiffModule;
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use models::{save_checkpoint, MlpNet, MlpNetConfig, Net, NetConfig};
use std::fs;
use std::path::Path;
use trojan_dataset::{generate, SyntheticConfig};

use crate::{train_classifier, ADBackend, Identity, TrainConfig};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Net,
    Mlp,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train a clean Net/MlpNet classifier on synthetic data")]
pub struct TrainArgs {
    /// Model to train.
    #[arg(long, value_enum, default_value_t = ModelKind::Net)]
    pub model: ModelKind,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Number of classes in the synthetic dataset.
    #[arg(long, default_value_t = 10)]
    pub num_classes: usize,
    /// Image side length (square images).
    #[arg(long, default_value_t = 16)]
    pub image_size: usize,
    /// Image channels.
    #[arg(long, default_value_t = 3)]
    pub channels: usize,
    /// Training samples per class.
    #[arg(long, default_value_t = 64)]
    pub train_per_class: usize,
    /// Number of epochs.
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,
    /// Batch size.
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,
    /// Seed for data generation and shuffling.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Checkpoint output path (defaults by model if not provided).
    #[arg(long)]
    pub checkpoint_out: Option<String>,
}

impl TrainArgs {
    pub fn data_shape(&self) -> [usize; 3] {
        [self.channels, self.image_size, self.image_size]
    }

    pub fn train_config(&self) -> TrainConfig {
        TrainConfig {
            epochs: self.epochs,
            lr: self.lr,
            batch_size: self.batch_size,
            seed: Some(self.seed),
            validate_interval: 1,
        }
    }
}

pub fn default_checkpoint(model: ModelKind) -> &'static str {
    match model {
        ModelKind::Net => "checkpoints/net",
        ModelKind::Mlp => "checkpoints/mlp",
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;

    let ckpt_path = args
        .checkpoint_out
        .clone()
        .unwrap_or_else(|| default_checkpoint(args.model).to_string());
    if let Some(parent) = Path::new(&ckpt_path).parent() {
        fs::create_dir_all(parent)?;
    }

    let splits = generate(&SyntheticConfig {
        data_shape: args.data_shape(),
        num_classes: args.num_classes,
        train_per_class: args.train_per_class,
        valid_per_class: (args.train_per_class / 4).max(1),
        seed: args.seed,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("failed to build synthetic dataset: {e}"))?;

    let device = <ADBackend as Backend>::Device::default();
    ADBackend::seed(args.seed);
    let cfg = args.train_config();
    match args.model {
        ModelKind::Net => {
            let model = Net::<ADBackend>::new(
                NetConfig {
                    data_shape: args.data_shape(),
                    num_classes: args.num_classes,
                    ..Default::default()
                },
                &device,
            );
            let model = train_classifier(model, &splits, &cfg, &mut Identity, &device)?;
            save_checkpoint(model.valid(), Path::new(&ckpt_path))?;
        }
        ModelKind::Mlp => {
            let model = MlpNet::<ADBackend>::new(
                MlpNetConfig {
                    data_shape: args.data_shape(),
                    num_classes: args.num_classes,
                    ..Default::default()
                },
                &device,
            );
            let model = train_classifier(model, &splits, &cfg, &mut Identity, &device)?;
            save_checkpoint(model.valid(), Path::new(&ckpt_path))?;
        }
    }

    println!("Saved checkpoint to {}", ckpt_path);
    Ok(())
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}
