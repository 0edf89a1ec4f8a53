//! Labeled image sets and Burn-compatible batching for backdoor experiments.
//!
//! This crate provides:
//! - `ImageSet`: flat CHW `f32` images plus integer labels, kept in memory
//! - `DatasetSplits`: named `train`/`valid` splits
//! - `BatchIter`: seeded, optionally shuffled batch iteration producing Burn tensors
//! - `synthetic`: deterministic class-pattern images for experiments without data
//! - `folder`: `root/<class>/<image>` loading through the `image` crate

pub mod batch;
pub mod folder;
pub mod splits;
pub mod synthetic;
pub mod types;

pub use batch::{Batch, BatchIter, LoaderConfig};
pub use folder::load_image_folder;
pub use splits::{sample_batch, split_holdout, DatasetSplits, Split};
pub use synthetic::{generate, SyntheticConfig};
pub use types::*;
