//! Fitness function: maps a backtest result to a non-negative scalar.
//!
//! `fitness = max(0, w_r·return + w_k·(1 − dd) + w_s·sharpe + w_d·(1 − dd))`
//!
//! The risk and drawdown weights both scale `(1 − maxDrawdown)` and are kept
//! as separate knobs. A zeroed result (never evaluated, failed, or no market
//! exposure at all) scores 0 rather than collecting the drawdown terms.

use serde::{Deserialize, Serialize};

use crate::domain::BacktestResult;

/// Weights of the fitness terms. All must be non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitnessWeights {
    pub return_weight: f64,
    pub risk_weight: f64,
    pub sharpe_weight: f64,
    pub drawdown_weight: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            return_weight: 0.4,
            risk_weight: 0.3,
            sharpe_weight: 0.2,
            drawdown_weight: 0.1,
        }
    }
}

impl FitnessWeights {
    pub fn as_array(&self) -> [(&'static str, f64); 4] {
        [
            ("return_weight", self.return_weight),
            ("risk_weight", self.risk_weight),
            ("sharpe_weight", self.sharpe_weight),
            ("drawdown_weight", self.drawdown_weight),
        ]
    }

    /// Score a result. Always finite and `>= 0`.
    ///
    /// A zeroed result (failed evaluation, or a run with no trades) scores 0
    /// rather than the `risk + drawdown` weight its zero drawdown would earn,
    /// so doing nothing never outranks a strategy that traded.
    pub fn score(&self, result: &BacktestResult) -> f64 {
        if result.is_zeroed() {
            return 0.0;
        }
        let retained = 1.0 - result.max_drawdown;
        let raw = self.return_weight * result.total_return
            + (self.risk_weight + self.drawdown_weight) * retained
            + self.sharpe_weight * result.sharpe_ratio;
        if raw.is_finite() {
            raw.max(0.0)
        } else {
            0.0
        }
    }
}
