//! Backend-free building blocks shared by attacks and defenses.
//!
//! This crate provides:
//! - `AverageMeter`: running mean accumulator used by every optimization loop
//! - `metric`: mask overlap, MAD anomaly scores, and binary classification reports
//! - `reparam`: the bounded `tanh` reparameterization that keeps masks in `[0, 1]`
//! - `output`: console formatting helpers for epoch progress lines
//!
//! Nothing in here depends on a tensor backend; the tensor-side counterparts
//! live in the `attacks` and `defenses` crates.

pub mod meter;
pub mod metric;
pub mod output;
pub mod reparam;

use thiserror::Error;

pub use meter::{AverageMeter, MeterFormat};
pub use metric::{mask_jaccard, normalize_mad, ClassificationReport, MadSide};
pub use output::{format_duration, output_iter};
pub use reparam::tanh_unit;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("length mismatch: {what} has {left} entries but {right} were expected")]
    LengthMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

pub mod prelude {
    pub use super::{
        format_duration, mask_jaccard, normalize_mad, output_iter, tanh_unit, AverageMeter,
        ClassificationReport, CoreError, CoreResult, MadSide,
    };
}
