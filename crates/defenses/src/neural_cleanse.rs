//! Neural Cleanse hooks: an adaptive norm cost plus patience-based early stop.

use crate::early_stop::Patience;
use crate::model_inspection::{EpochStats, InspectionHooks};

#[derive(Debug, Clone)]
pub struct NeuralCleanseConfig {
    pub init_cost: f64,
    /// Percent accuracy counted as a successful mark.
    pub attack_succ_threshold: f64,
    /// Epochs of (un)successful marks before the cost moves.
    pub cost_patience: usize,
    pub cost_multiplier: f64,
    pub early_stop: bool,
    pub early_stop_patience: usize,
    pub early_stop_threshold: f64,
}

impl Default for NeuralCleanseConfig {
    fn default() -> Self {
        Self {
            init_cost: 1e-3,
            attack_succ_threshold: 99.0,
            cost_patience: 10,
            cost_multiplier: 1.5,
            early_stop: true,
            early_stop_patience: 20,
            early_stop_threshold: 1e-3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NeuralCleanse {
    cfg: NeuralCleanseConfig,
    patience: Patience,
    cost: f64,
    cost_set_counter: usize,
    cost_up_counter: usize,
    cost_down_counter: usize,
    cost_up_flag: bool,
    cost_down_flag: bool,
}

impl NeuralCleanse {
    pub fn new(cfg: NeuralCleanseConfig) -> Self {
        let patience = Patience::new(
            cfg.early_stop_patience,
            cfg.early_stop_threshold,
            cfg.attack_succ_threshold,
        );
        Self {
            cost: cfg.init_cost,
            cfg,
            patience,
            cost_set_counter: 0,
            cost_up_counter: 0,
            cost_down_counter: 0,
            cost_up_flag: false,
            cost_down_flag: false,
        }
    }

    pub fn current_cost(&self) -> f64 {
        self.cost
    }

    fn cost_multiplier_down(&self) -> f64 {
        self.cfg.cost_multiplier.powf(1.5)
    }
}

impl Default for NeuralCleanse {
    fn default() -> Self {
        Self::new(NeuralCleanseConfig::default())
    }
}

impl InspectionHooks for NeuralCleanse {
    fn name(&self) -> &'static str {
        "neural_cleanse"
    }

    fn before_loop_fn(&mut self, _label: i64) {
        self.cost = self.cfg.init_cost;
        self.cost_set_counter = 0;
        self.cost_up_counter = 0;
        self.cost_down_counter = 0;
        self.cost_up_flag = false;
        self.cost_down_flag = false;
        self.patience.reset();
    }

    fn cost(&self, _init_cost: f64) -> f64 {
        self.cost
    }

    fn after_epoch(&mut self, stats: &EpochStats) {
        let success = stats.acc >= self.cfg.attack_succ_threshold;
        if self.cost == 0.0 && success {
            self.cost_set_counter += 1;
            if self.cost_set_counter >= self.cfg.cost_patience {
                self.cost = self.cfg.init_cost;
                self.cost_up_counter = 0;
                self.cost_down_counter = 0;
                self.cost_up_flag = false;
                self.cost_down_flag = false;
                tracing::debug!(cost = self.cost, "initialize cost");
            }
            return;
        }
        if success {
            self.cost_up_counter += 1;
            self.cost_down_counter = 0;
        } else {
            self.cost_up_counter = 0;
            self.cost_down_counter += 1;
        }
        if self.cost_up_counter >= self.cfg.cost_patience {
            self.cost_up_counter = 0;
            self.cost *= self.cfg.cost_multiplier;
            self.cost_up_flag = true;
            tracing::debug!(cost = self.cost, "cost up");
        } else if self.cost_down_counter >= self.cfg.cost_patience {
            self.cost_down_counter = 0;
            self.cost /= self.cost_multiplier_down();
            self.cost_down_flag = true;
            tracing::debug!(cost = self.cost, "cost down");
        }
    }

    /// Only stops once the cost has moved both ways.
    fn check_early_stop(&mut self, stats: &EpochStats) -> bool {
        let stalled = self.patience.update(stats);
        self.cfg.early_stop && self.cost_up_flag && self.cost_down_flag && stalled
    }
}
