use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_CONFIG_NAME: &str = "backdoor-lab.toml";
/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV: &str = "BACKDOOR_LAB_CONFIG";

/// Output locations and training defaults shared by the experiment binaries.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub results_root: PathBuf,
    pub checkpoints_root: PathBuf,
    pub marks_root: PathBuf,
    /// Model inspection archives.
    pub cache_dir: PathBuf,
    pub metrics_path: PathBuf,
    pub epochs: usize,
    pub lr: f64,
    pub batch_size: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let results_root = PathBuf::from("results");
        Self {
            checkpoints_root: PathBuf::from("checkpoints"),
            marks_root: results_root.join("marks"),
            cache_dir: results_root.join("defenses"),
            metrics_path: PathBuf::from("logs/metrics.jsonl"),
            results_root,
            epochs: 10,
            lr: 1e-3,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ExperimentConfigFile {
    results_root: Option<String>,
    checkpoints_root: Option<String>,
    marks_root: Option<String>,
    cache_dir: Option<String>,
    metrics_path: Option<String>,
    training: Option<TrainingSection>,
}

#[derive(Debug, Deserialize, Default)]
struct TrainingSection {
    epochs: Option<usize>,
    lr: Option<f64>,
    batch_size: Option<usize>,
}

impl ExperimentConfig {
    /// `$BACKDOOR_LAB_CONFIG`, else `backdoor-lab.toml`, else defaults.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_NAME));
        let cfg = Self::from_path(&path).unwrap_or_default();
        cfg.warn_if_invalid();
        cfg
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let raw = std::fs::read_to_string(path).ok()?;
        match toml::from_str::<ExperimentConfigFile>(&raw) {
            Ok(file) => Some(Self::from_file(file)),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "ignoring unparsable config");
                None
            }
        }
    }

    fn from_file(file: ExperimentConfigFile) -> Self {
        let defaults = Self::default();
        let results_root = file
            .results_root
            .map(|v| expand_path(&v))
            .unwrap_or(defaults.results_root);
        let training = file.training.unwrap_or_default();
        ExperimentConfig {
            checkpoints_root: file
                .checkpoints_root
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.checkpoints_root),
            marks_root: file
                .marks_root
                .map(|v| expand_path(&v))
                .unwrap_or_else(|| results_root.join("marks")),
            cache_dir: file
                .cache_dir
                .map(|v| expand_path(&v))
                .unwrap_or_else(|| results_root.join("defenses")),
            metrics_path: file
                .metrics_path
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.metrics_path),
            results_root,
            epochs: training.epochs.unwrap_or(defaults.epochs),
            lr: training.lr.unwrap_or(defaults.lr),
            batch_size: training.batch_size.unwrap_or(defaults.batch_size),
        }
    }

    fn warn_if_invalid(&self) {
        if self.epochs == 0 {
            tracing::warn!("config: training.epochs is 0; attacked models will be untrained");
        }
        if self.batch_size == 0 {
            tracing::warn!("config: training.batch_size is 0; batches fall back to size 1");
        }
        if self.lr <= 0.0 {
            tracing::warn!(lr = self.lr, "config: training.lr is not positive");
        }
    }

    /// `{checkpoints_root}/{model}_{stem}.bin` for an attacked model.
    pub fn checkpoint_path(&self, model: &str, stem: &str) -> PathBuf {
        self.checkpoints_root.join(format!("{model}_{stem}.bin"))
    }

    pub fn mark_png_path(&self, stem: &str) -> PathBuf {
        self.marks_root.join(format!("{stem}.png"))
    }
}

pub(crate) fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

/// Replace `${VAR}` with its value; unknown variables are kept verbatim.
fn expand_env(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&format!("${{{key}}}")),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
