//! Burn image classifiers used as attack and defense targets.
//!
//! This crate defines:
//! - `ImageModel`: the capability set attacks and defenses need from a model
//!   (logits, named intermediate outputs, named weights, criterion).
//! - `Net`: small convolutional classifier.
//! - `MlpNet`: flatten + one hidden layer, handy when weights must be set by hand.
//!
//! Architectures are deliberately small; the experiment code only relies on
//! the `ImageModel` surface.

mod checkpoint;
mod mlp;
mod net;

use burn::module::Module;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use thiserror::Error;

pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use mlp::{MlpNet, MlpNetConfig};
pub use net::{Net, NetConfig};

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown layer {layer:?}; available: {available:?}")]
    UnknownLayer {
        layer: String,
        available: Vec<&'static str>,
    },
    #[error("unknown parameter {0:?}")]
    UnknownParameter(String),
    #[error("checkpoint error at {path}: {msg}")]
    Recorder { path: String, msg: String },
}

/// Output of a named layer, either flat features or a spatial feature map.
#[derive(Debug, Clone)]
pub enum LayerOutput<B: Backend> {
    /// `[N, K]`
    Flat(Tensor<B, 2>),
    /// `[N, K, H, W]`
    Spatial(Tensor<B, 4>),
}

impl<B: Backend> LayerOutput<B> {
    /// `[N, K]` activations with spatial positions averaged out.
    pub fn channel_activation(self) -> Tensor<B, 2> {
        match self {
            LayerOutput::Flat(x) => x,
            LayerOutput::Spatial(x) => x.mean_dim(3).mean_dim(2).flatten::<2>(1, 3),
        }
    }

    /// Like [`channel_activation`](Self::channel_activation) but on absolute values.
    pub fn abs_channel_activation(self) -> Tensor<B, 2> {
        match self {
            LayerOutput::Flat(x) => x.abs(),
            LayerOutput::Spatial(x) => x.abs().mean_dim(3).mean_dim(2).flatten::<2>(1, 3),
        }
    }

    pub fn num_channels(&self) -> usize {
        match self {
            LayerOutput::Flat(x) => x.dims()[1],
            LayerOutput::Spatial(x) => x.dims()[1],
        }
    }
}

/// A weight looked up by name (`"<layer>.weight"`).
#[derive(Debug, Clone)]
pub enum NamedWeight<B: Backend> {
    /// Burn linear layout `[in, out]`.
    Linear(Tensor<B, 2>),
    /// Convolution layout `[out, in, kh, kw]`.
    Conv(Tensor<B, 4>),
}

impl<B: Backend> NamedWeight<B> {
    /// Mean absolute weight attached to each input neuron: `[in]`.
    pub fn abs_mean_per_input(self) -> Tensor<B, 1> {
        match self {
            NamedWeight::Linear(w) => {
                let [d_in, _] = w.dims();
                w.abs().mean_dim(1).reshape([d_in])
            }
            NamedWeight::Conv(w) => {
                let [_, d_in, _, _] = w.dims();
                w.abs()
                    .mean_dim(3)
                    .mean_dim(2)
                    .mean_dim(0)
                    .reshape([d_in])
            }
        }
    }
}

/// What attacks and defenses need from a classifier.
pub trait ImageModel<B: Backend>: Module<B> {
    fn num_classes(&self) -> usize;

    /// Input shape `[C, H, W]`.
    fn data_shape(&self) -> [usize; 3];

    /// Logits `[N, num_classes]`.
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2>;

    fn layer_names(&self) -> Vec<&'static str>;

    fn get_layer(&self, input: Tensor<B, 4>, layer: &str) -> ModelResult<LayerOutput<B>>;

    fn named_weight(&self, name: &str) -> ModelResult<NamedWeight<B>>;

    /// Mean cross entropy.
    fn criterion(&self, logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, labels)
    }
}

pub(crate) fn unknown_layer<B: Backend, M: ImageModel<B>>(model: &M, layer: &str) -> ModelError {
    ModelError::UnknownLayer {
        layer: layer.to_string(),
        available: model.layer_names(),
    }
}

pub mod prelude {
    pub use super::{
        ImageModel, LayerOutput, MlpNet, MlpNetConfig, ModelError, ModelResult, NamedWeight, Net,
        NetConfig,
    };
}
