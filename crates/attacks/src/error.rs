use models::ModelError;
use std::path::PathBuf;
use thiserror::Error;
use trojan_dataset::DatasetError;

pub type AttackResult<T> = Result<T, AttackError>;

#[derive(Debug, Error)]
pub enum AttackError {
    /// Invalid or incompatible settings, reported at construction.
    #[error("invalid attack configuration: {0}")]
    Config(String),
    #[error("mark shape {got:?} does not match expected {expected:?}")]
    MarkShape { got: Vec<usize>, expected: Vec<usize> },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("attack artifact {path}: {msg}")]
    Artifact { path: PathBuf, msg: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mark image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

pub(crate) fn config_err(msg: impl Into<String>) -> AttackError {
    AttackError::Config(msg.into())
}
