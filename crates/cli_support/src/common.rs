use attacks::{BadNetConfig, MarkConfig, NeuronSelection, TrainMode, TrojanNnConfig};
use clap::{Args, ValueEnum};
use defenses::{InspectionConfig, NeuralCleanseConfig, SpectralConfig, StripConfig};
use std::path::PathBuf;
use trojan_dataset::SyntheticConfig;

/// Synthetic dataset shape and size.
#[derive(Debug, Clone, Args)]
pub struct DataArgs {
    #[arg(long, default_value_t = 10)]
    pub num_classes: usize,
    /// Image side length (square images).
    #[arg(long, default_value_t = 16)]
    pub image_size: usize,
    #[arg(long, default_value_t = 3)]
    pub channels: usize,
    #[arg(long, default_value_t = 64)]
    pub train_per_class: usize,
    #[arg(long, default_value_t = 16)]
    pub valid_per_class: usize,
    /// Seed for data generation, shuffling and attack sampling.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl DataArgs {
    pub fn data_shape(&self) -> [usize; 3] {
        [self.channels, self.image_size, self.image_size]
    }

    pub fn synthetic_config(&self) -> SyntheticConfig {
        SyntheticConfig {
            data_shape: self.data_shape(),
            num_classes: self.num_classes,
            train_per_class: self.train_per_class,
            valid_per_class: self.valid_per_class,
            seed: self.seed,
            ..Default::default()
        }
    }
}

/// Trigger mark geometry and appearance.
#[derive(Debug, Clone, Args)]
pub struct MarkArgs {
    #[arg(long, default_value_t = 3)]
    pub mark_height: usize,
    #[arg(long, default_value_t = 3)]
    pub mark_width: usize,
    #[arg(long, default_value_t = 0)]
    pub height_offset: usize,
    #[arg(long, default_value_t = 0)]
    pub width_offset: usize,
    /// Place the mark at a random position per batch.
    #[arg(long, default_value_t = false)]
    pub random_pos: bool,
    /// Random pattern pixels instead of a white patch.
    #[arg(long, default_value_t = false)]
    pub random_init: bool,
    #[arg(long, default_value_t = 1.0)]
    pub mark_alpha: f32,
    /// Optional image to load the mark from (resized to the mark size).
    #[arg(long)]
    pub mark_path: Option<PathBuf>,
    /// RGB color treated as transparent when loading `mark_path`, e.g. `0,0,0`.
    #[arg(long, value_delimiter = ',', num_args = 3)]
    pub mark_background: Option<Vec<u8>>,
}

impl MarkArgs {
    pub fn background(&self) -> Option<[u8; 3]> {
        match self.mark_background.as_deref() {
            Some([r, g, b]) => Some([*r, *g, *b]),
            _ => None,
        }
    }

    pub fn mark_config(&self, seed: Option<u64>) -> MarkConfig {
        MarkConfig {
            mark_height: self.mark_height,
            mark_width: self.mark_width,
            height_offset: self.height_offset,
            width_offset: self.width_offset,
            random_pos: self.random_pos,
            random_init: self.random_init,
            mark_alpha: self.mark_alpha,
            seed,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackKind {
    Badnet,
    Trojannn,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainModeArg {
    #[default]
    Batch,
    Dataset,
}

impl From<TrainModeArg> for TrainMode {
    fn from(arg: TrainModeArg) -> Self {
        match arg {
            TrainModeArg::Batch => TrainMode::Batch,
            TrainModeArg::Dataset => TrainMode::Dataset,
        }
    }
}

/// Attack selection plus BadNet and TrojanNN knobs.
#[derive(Debug, Clone, Args)]
pub struct AttackArgs {
    #[arg(long, value_enum, default_value_t = AttackKind::Badnet)]
    pub attack: AttackKind,
    #[arg(long, default_value_t = 0)]
    pub target_class: i64,
    /// Fraction of poisoned samples in the training stream.
    #[arg(long, default_value_t = 0.01)]
    pub poison_percent: f64,
    #[arg(long, value_enum, default_value_t = TrainModeArg::Batch)]
    pub train_mode: TrainModeArg,
    /// TrojanNN: layer whose neurons the mark is tuned for.
    #[arg(long, default_value = "features")]
    pub preprocess_layer: String,
    /// TrojanNN: select neurons by the outgoing weights of this layer
    /// instead of by activation.
    #[arg(long)]
    pub preprocess_next_layer: Option<String>,
    #[arg(long, default_value_t = 100.0)]
    pub target_value: f32,
    #[arg(long, default_value_t = 2)]
    pub neuron_num: usize,
    #[arg(long, default_value_t = 0.1)]
    pub neuron_lr: f64,
    #[arg(long, default_value_t = 1000)]
    pub neuron_epoch: usize,
}

impl AttackArgs {
    pub fn badnet_config(&self, seed: Option<u64>) -> BadNetConfig {
        BadNetConfig {
            target_class: self.target_class,
            poison_percent: self.poison_percent,
            train_mode: self.train_mode.into(),
            seed,
        }
    }

    pub fn trojannn_config(&self) -> TrojanNnConfig {
        let selection = match &self.preprocess_next_layer {
            Some(next_layer) => NeuronSelection::NextLayerWeight {
                next_layer: next_layer.clone(),
            },
            None => NeuronSelection::Activation,
        };
        TrojanNnConfig {
            preprocess_layer: self.preprocess_layer.clone(),
            target_value: self.target_value,
            neuron_num: self.neuron_num,
            neuron_lr: self.neuron_lr,
            neuron_epoch: self.neuron_epoch,
            selection,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefenseKind {
    Strip,
    Spectral,
    NeuralCleanse,
}

/// Defense selection and per-defense knobs.
#[derive(Debug, Clone, Args)]
pub struct DefenseArgs {
    #[arg(long, value_enum, default_value_t = DefenseKind::NeuralCleanse)]
    pub defense: DefenseKind,
    /// Inputs to score (input filtering) or to sample (training filtering).
    #[arg(long)]
    pub defense_input_num: Option<usize>,
    #[arg(long, default_value_t = 0.5)]
    pub strip_alpha: f32,
    #[arg(long, default_value_t = 100)]
    pub strip_fusion_num: usize,
    #[arg(long, default_value = "features")]
    pub spectral_layer: String,
    #[arg(long, default_value_t = 10)]
    pub remask_epoch: usize,
    #[arg(long, default_value_t = 0.1)]
    pub remask_lr: f64,
    #[arg(long, default_value_t = 1e-3)]
    pub init_cost: f64,
    /// Disable Neural Cleanse early stopping.
    #[arg(long, default_value_t = false)]
    pub no_early_stop: bool,
}

impl DefenseArgs {
    pub fn strip_config(&self, seed: Option<u64>) -> StripConfig {
        StripConfig {
            strip_alpha: self.strip_alpha,
            fusion_num: self.strip_fusion_num,
            seed,
        }
    }

    pub fn spectral_config(&self, seed: Option<u64>) -> SpectralConfig {
        SpectralConfig {
            layer: self.spectral_layer.clone(),
            seed,
            ..Default::default()
        }
    }

    pub fn inspection_config(
        &self,
        batch_size: usize,
        cache_dir: PathBuf,
        seed: Option<u64>,
    ) -> InspectionConfig {
        InspectionConfig {
            remask_epoch: self.remask_epoch,
            remask_lr: self.remask_lr,
            init_cost: self.init_cost,
            batch_size,
            cache_dir,
            seed,
            ..Default::default()
        }
    }

    pub fn neural_cleanse_config(&self) -> NeuralCleanseConfig {
        NeuralCleanseConfig {
            init_cost: self.init_cost,
            early_stop: !self.no_early_stop,
            ..Default::default()
        }
    }
}
