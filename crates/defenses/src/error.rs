use attacks::AttackError;
use models::ModelError;
use std::path::PathBuf;
use thiserror::Error;
use trojan_core::CoreError;
use trojan_dataset::DatasetError;

pub type DefenseResult<T> = Result<T, DefenseError>;

#[derive(Debug, Error)]
pub enum DefenseError {
    #[error("invalid defense configuration: {0}")]
    Config(String),
    /// Missing keys, wrong dtypes or inconsistent shapes in a cached artifact.
    #[error("artifact {path}: {msg}")]
    Artifact { path: PathBuf, msg: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Attack(#[from] AttackError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Metric(#[from] CoreError),
}

pub(crate) fn artifact_err(path: &std::path::Path, msg: impl Into<String>) -> DefenseError {
    DefenseError::Artifact {
        path: path.to_path_buf(),
        msg: msg.into(),
    }
}
