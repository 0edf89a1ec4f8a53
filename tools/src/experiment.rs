//! Setup shared by the attack and defense binaries.

use attacks::{AttackArtifact, BackdoorAttack, BadNet, Watermark};
use burn::tensor::backend::Backend;
use clap::Args;
use cli_support::{AttackArgs, AttackKind, DataArgs, MarkArgs};
use models::{MlpNet, MlpNetConfig, Net, NetConfig};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use training::util::ModelKind;
use training::{TrainConfig, ADBackend};

use crate::config::ExperimentConfig;

pub type Device = <ADBackend as Backend>::Device;

/// Command-line overrides of the configured training defaults.
#[derive(Debug, Clone, Args)]
pub struct TrainOverrides {
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub lr: Option<f64>,
    #[arg(long)]
    pub batch_size: Option<usize>,
}

impl TrainOverrides {
    pub fn train_config(&self, cfg: &ExperimentConfig, seed: u64) -> TrainConfig {
        TrainConfig {
            epochs: self.epochs.unwrap_or(cfg.epochs),
            lr: self.lr.unwrap_or(cfg.lr),
            batch_size: self.batch_size.unwrap_or(cfg.batch_size).max(1),
            seed: Some(seed),
            validate_interval: 1,
        }
    }
}

pub fn model_name(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::Net => "net",
        ModelKind::Mlp => "mlp",
    }
}

pub fn new_net(data: &DataArgs, device: &Device) -> Net<ADBackend> {
    Net::new(
        NetConfig {
            data_shape: data.data_shape(),
            num_classes: data.num_classes,
            ..Default::default()
        },
        device,
    )
}

pub fn new_mlp(data: &DataArgs, device: &Device) -> MlpNet<ADBackend> {
    MlpNet::new(
        MlpNetConfig {
            data_shape: data.data_shape(),
            num_classes: data.num_classes,
            ..Default::default()
        },
        device,
    )
}

/// Mark plus BadNet wrapper; TrojanNN gets a randomly initialized mark.
pub fn build_badnet(
    data: &DataArgs,
    mark: &MarkArgs,
    attack: &AttackArgs,
    device: &Device,
) -> anyhow::Result<BadNet<ADBackend>> {
    let mut mark_cfg = mark.mark_config(Some(data.seed));
    if attack.attack == AttackKind::Trojannn && !mark_cfg.random_init {
        tracing::warn!("trojannn optimizes the mark pattern; enabling random_init");
        mark_cfg.random_init = true;
    }
    let watermark = match &mark.mark_path {
        Some(path) => Watermark::from_image(
            path,
            data.data_shape(),
            &mark_cfg,
            mark.background(),
            device,
        )?,
        None => Watermark::new(data.data_shape(), &mark_cfg, device)?,
    };
    Ok(BadNet::new(
        attack.badnet_config(Some(data.seed)),
        watermark,
    )?)
}

/// Append one JSON object per line, creating the parent directory.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(value)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Attack state saved beside `ckpt`: `net_x.bin` -> `net_x.mark.safetensors`.
pub fn artifact_path(ckpt: &Path) -> PathBuf {
    ckpt.with_extension("mark.safetensors")
}

pub fn save_attack_artifact<B: Backend, A: BackdoorAttack<B>>(
    attack: &A,
    ckpt: &Path,
) -> anyhow::Result<PathBuf> {
    let path = artifact_path(ckpt);
    attack.artifact().save(&path)?;
    Ok(path)
}

/// Restore the trained mark for a loaded checkpoint. Returns false when no
/// artifact was saved with it.
pub fn restore_attack_artifact<B: Backend, A: BackdoorAttack<B>>(
    attack: &mut A,
    ckpt: &Path,
) -> anyhow::Result<bool> {
    let path = artifact_path(ckpt);
    if !path.exists() {
        return Ok(false);
    }
    let artifact = AttackArtifact::load(&path)?;
    attack.restore(&artifact, &path)?;
    tracing::info!(path = %path.display(), "restored attack mark");
    Ok(true)
}

pub fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
