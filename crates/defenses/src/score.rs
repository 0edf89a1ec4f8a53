//! Turning clean/poison anomaly scores into predicted "poisoned" labels.

/// Output order is `clean_scores` then `poison_scores`; `true` means poisoned.
pub trait ScoreToLabel {
    fn score2label(&self, clean_scores: &[f32], poison_scores: &[f32]) -> Vec<bool>;
}

impl<F> ScoreToLabel for F
where
    F: Fn(&[f32], &[f32]) -> Vec<bool>,
{
    fn score2label(&self, clean_scores: &[f32], poison_scores: &[f32]) -> Vec<bool> {
        self(clean_scores, poison_scores)
    }
}

/// Flags the `poison_scores.len()` highest pooled scores.
///
/// Ties keep clean scores ahead of poison scores in the ranking.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankSplit;

impl ScoreToLabel for RankSplit {
    fn score2label(&self, clean_scores: &[f32], poison_scores: &[f32]) -> Vec<bool> {
        let pooled: Vec<f32> = clean_scores.iter().chain(poison_scores).copied().collect();
        let mut order: Vec<usize> = (0..pooled.len()).collect();
        order.sort_by(|&a, &b| pooled[b].total_cmp(&pooled[a]));
        let mut labels = vec![false; pooled.len()];
        for &i in order.iter().take(poison_scores.len()) {
            labels[i] = true;
        }
        labels
    }
}

/// Flags scores strictly above the threshold.
#[derive(Debug, Clone, Copy)]
pub struct Threshold(pub f32);

impl ScoreToLabel for Threshold {
    fn score2label(&self, clean_scores: &[f32], poison_scores: &[f32]) -> Vec<bool> {
        clean_scores
            .iter()
            .chain(poison_scores)
            .map(|s| *s > self.0)
            .collect()
    }
}

/// Flags every non-zero score.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonZero;

impl ScoreToLabel for NonZero {
    fn score2label(&self, clean_scores: &[f32], poison_scores: &[f32]) -> Vec<bool> {
        clean_scores
            .iter()
            .chain(poison_scores)
            .map(|s| *s != 0.0)
            .collect()
    }
}

/// `clean_len` false followed by `poison_len` true.
pub fn true_labels(clean_len: usize, poison_len: usize) -> Vec<bool> {
    let mut labels = vec![false; clean_len];
    labels.resize(clean_len + poison_len, true);
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sorted(mut v: Vec<f32>) -> Vec<f32> {
        v.sort_by(f32::total_cmp);
        v
    }

    #[test]
    fn rank_split_flags_the_high_scores() {
        let labels = RankSplit.score2label(&[0.1, 0.2, 0.9], &[0.5, 0.8, 1.0]);
        assert_eq!(labels, vec![false, false, true, false, true, true]);
    }

    #[test]
    fn rank_split_ties_keep_clean_first() {
        let labels = RankSplit.score2label(&[1.0, 1.0], &[1.0, 1.0]);
        assert_eq!(labels, vec![true, true, false, false]);
    }

    #[test]
    fn threshold_and_nonzero() {
        assert_eq!(
            Threshold(0.5).score2label(&[0.5, 0.6], &[0.4, 2.0]),
            vec![false, true, false, true]
        );
        assert_eq!(
            NonZero.score2label(&[0.0, -1.0], &[0.0]),
            vec![false, true, false]
        );
    }

    #[test]
    fn closures_are_policies() {
        let all_poison = |c: &[f32], p: &[f32]| vec![true; c.len() + p.len()];
        assert_eq!(all_poison.score2label(&[1.0], &[2.0]), vec![true, true]);
    }

    proptest! {
        #[test]
        fn rank_split_is_balanced(
            (clean, poison) in (1usize..64).prop_flat_map(|n| (
                prop::collection::vec(-1e3f32..1e3, n),
                prop::collection::vec(-1e3f32..1e3, n),
            ))
        ) {
            let n = clean.len();
            let labels = RankSplit.score2label(&sorted(clean), &sorted(poison));
            prop_assert_eq!(labels.len(), 2 * n);
            prop_assert_eq!(labels.iter().filter(|l| **l).count(), n);
        }
    }

    #[test]
    fn ground_truth_layout() {
        assert_eq!(true_labels(2, 1), vec![false, false, true]);
    }
}
