//! Detection and overlap metrics used to score defenses.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Consistency constant turning a MAD into a standard-deviation estimate.
pub const MAD_SCALE: f64 = 1.4826;

/// Which deviations share a MAD estimate in [`normalize_mad`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MadSide {
    /// One MAD over all absolute deviations.
    #[default]
    Single,
    /// Separate MADs for values below and above the median.
    Double,
}

/// Lower median: for an even count the smaller of the two middle values.
pub fn lower_median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Some(sorted[(sorted.len() - 1) / 2])
}

fn scaled(abs_dev: f64, mad: f64) -> f64 {
    if mad > 0.0 {
        abs_dev / mad / MAD_SCALE
    } else if abs_dev == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}

/// Robust anomaly index: `|x - median| / MAD / 1.4826`.
///
/// Medians follow the lower-median convention. A zero MAD maps zero
/// deviations to `0.0` and every other deviation to `+inf`.
pub fn normalize_mad(values: &[f64], side: MadSide) -> Vec<f64> {
    let Some(med) = lower_median(values) else {
        return Vec::new();
    };
    let abs_dev: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    match side {
        MadSide::Single => {
            let mad = lower_median(&abs_dev).unwrap_or(0.0);
            abs_dev.iter().map(|d| scaled(*d, mad)).collect()
        }
        MadSide::Double => {
            let low: Vec<f64> = values
                .iter()
                .filter(|v| **v <= med)
                .map(|v| med - v)
                .collect();
            let high: Vec<f64> = values
                .iter()
                .filter(|v| **v >= med)
                .map(|v| v - med)
                .collect();
            let mad_low = lower_median(&low).unwrap_or(0.0);
            let mad_high = lower_median(&high).unwrap_or(0.0);
            values
                .iter()
                .zip(&abs_dev)
                .map(|(v, d)| {
                    // Values equal to the median fall in both halves; the upper one wins.
                    if *v >= med {
                        scaled(*d, mad_high)
                    } else {
                        scaled(*d, mad_low)
                    }
                })
                .collect()
        }
    }
}

fn top_k_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    // Stable sort keeps lower indices first among ties.
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(k);
    order.sort_unstable();
    order
}

/// Jaccard overlap between the top-`select_num` pixels of two masks.
///
/// Both masks are flattened row-major and must have equal length.
/// `select_num` is clamped to `[1, len]`.
pub fn mask_jaccard(mask: &[f32], real_mask: &[f32], select_num: usize) -> CoreResult<f32> {
    if mask.len() != real_mask.len() {
        return Err(CoreError::LengthMismatch {
            what: "mask",
            left: mask.len(),
            right: real_mask.len(),
        });
    }
    if mask.is_empty() {
        return Err(CoreError::Empty("mask"));
    }
    let k = select_num.clamp(1, mask.len());
    let a = top_k_indices(mask, k);
    let b = top_k_indices(real_mask, k);

    let (mut i, mut j, mut inter) = (0usize, 0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                inter += 1;
                i += 1;
                j += 1;
            }
        }
    }
    let union = a.len() + b.len() - inter;
    Ok(inter as f32 / union as f32)
}

/// Binary detection quality, "poisoned" being the positive class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ClassificationReport {
    /// Undefined ratios (no predicted or no actual positives) are reported as 0.0.
    pub fn from_labels(y_true: &[bool], y_pred: &[bool]) -> CoreResult<Self> {
        if y_true.len() != y_pred.len() {
            return Err(CoreError::LengthMismatch {
                what: "y_pred",
                left: y_pred.len(),
                right: y_true.len(),
            });
        }
        if y_true.is_empty() {
            return Err(CoreError::Empty("y_true"));
        }
        let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
        for (t, p) in y_true.iter().zip(y_pred) {
            match (*t, *p) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (false, false) => tn += 1,
                (true, false) => fn_ += 1,
            }
        }
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = ratio(2 * tp, 2 * tp + fp + fn_);
        let accuracy = ratio(tp + tn, y_true.len());
        Ok(Self {
            f1,
            precision,
            recall,
            accuracy,
            true_positive: tp,
            false_positive: fp,
            true_negative: tn,
            false_negative: fn_,
        })
    }

    pub fn print(&self) {
        println!("f1_score: {:.4}", self.f1);
        println!("precision_score: {:.4}", self.precision);
        println!("recall_score: {:.4}", self.recall);
        println!("accuracy_score: {:.4}", self.accuracy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medians() {
        assert_eq!(lower_median(&[4.0, 1.0, 3.0, 2.0]), Some(2.0));
        assert_eq!(lower_median(&[]), None);
    }

    #[test]
    fn mad_flags_the_outlier() {
        let scores = normalize_mad(&[10.0, 11.0, 9.0, 10.5, 2.0], MadSide::Single);
        let (argmax, _) = scores
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc });
        assert_eq!(argmax, 4);
        assert!(scores[4] > 2.0);
    }

    #[test]
    fn mad_zero_spread() {
        let scores = normalize_mad(&[1.0, 1.0, 1.0, 5.0], MadSide::Single);
        assert_eq!(&scores[..3], &[0.0, 0.0, 0.0]);
        assert!(scores[3].is_infinite());
    }

    #[test]
    fn double_sided_mad_uses_separate_scales() {
        let values = [0.0, 4.0, 5.0, 6.0, 50.0];
        let scores = normalize_mad(&values, MadSide::Double);
        // low side deviations {5, 1, 0}: lower median 1; high side {0, 1, 45}: 1
        assert!((scores[0] - 5.0 / MAD_SCALE).abs() < 1e-9);
        assert!((scores[4] - 45.0 / MAD_SCALE).abs() < 1e-9);
    }

    #[test]
    fn jaccard_of_identical_masks_is_one() {
        let mask = [0.1, 0.9, 0.3, 0.9, 0.0, 0.2];
        assert_eq!(mask_jaccard(&mask, &mask, 3).unwrap(), 1.0);
    }

    #[test]
    fn jaccard_partial_overlap() {
        let est = [1.0, 1.0, 0.0, 0.0];
        let real = [0.0, 1.0, 1.0, 0.0];
        // {0,1} vs {1,2}: 1 / 3
        let j = mask_jaccard(&est, &real, 2).unwrap();
        assert!((j - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn jaccard_rejects_mismatched_lengths() {
        assert!(mask_jaccard(&[1.0], &[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn report_matches_hand_counts() {
        let y_true = [false, false, true, true];
        let y_pred = [false, true, true, false];
        let r = ClassificationReport::from_labels(&y_true, &y_pred).unwrap();
        assert_eq!((r.true_positive, r.false_positive), (1, 1));
        assert!((r.precision - 0.5).abs() < 1e-12);
        assert!((r.recall - 0.5).abs() < 1e-12);
        assert!((r.f1 - 0.5).abs() < 1e-12);
        assert!((r.accuracy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn report_zero_division_is_zero() {
        let r = ClassificationReport::from_labels(&[false, false], &[false, false]).unwrap();
        assert_eq!(r.precision, 0.0);
        assert_eq!(r.f1, 0.0);
        assert_eq!(r.accuracy, 1.0);
    }
}
