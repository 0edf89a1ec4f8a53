//! Early-stop policies for the per-class mark optimization.

use crate::model_inspection::{EpochStats, InspectionHooks};

/// Runs every epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl InspectionHooks for NeverStop {}

/// Stops once accuracy reached `min_acc` and the mask norm has not improved
/// by more than `threshold` (relative) for `patience` consecutive epochs.
#[derive(Debug, Clone)]
pub struct Patience {
    pub patience: usize,
    pub threshold: f64,
    /// Percent.
    pub min_acc: f64,
    best_norm: f64,
    counter: usize,
}

impl Patience {
    pub fn new(patience: usize, threshold: f64, min_acc: f64) -> Self {
        Self {
            patience: patience.max(1),
            threshold,
            min_acc,
            best_norm: f64::INFINITY,
            counter: 0,
        }
    }

    pub fn reset(&mut self) {
        self.best_norm = f64::INFINITY;
        self.counter = 0;
    }

    pub fn update(&mut self, stats: &EpochStats) -> bool {
        if stats.norm < self.best_norm * (1.0 - self.threshold) {
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        if stats.norm < self.best_norm {
            self.best_norm = stats.norm;
        }
        stats.acc >= self.min_acc && self.counter >= self.patience
    }
}

impl Default for Patience {
    fn default() -> Self {
        Self::new(5, 1e-3, 99.0)
    }
}

impl InspectionHooks for Patience {
    fn before_loop_fn(&mut self, _label: i64) {
        self.reset();
    }

    fn check_early_stop(&mut self, stats: &EpochStats) -> bool {
        self.update(stats)
    }
}
