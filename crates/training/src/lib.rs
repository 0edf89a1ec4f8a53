pub mod trainer;
pub mod util;

pub use trainer::{
    correct_count, evaluate, scalar, train_classifier, BatchTransform, EvalResult, Identity, TrainConfig,
};
pub use util::{run_train, TrainArgs};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

/// Autodiff wrapper used by every optimization loop.
pub type ADBackend = burn::backend::Autodiff<TrainBackend>;
