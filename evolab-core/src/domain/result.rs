//! Backtest result: the immutable performance record of one evaluation.

use serde::{Deserialize, Serialize};

/// Performance of a descriptor over one OHLCV series.
///
/// `Default` is the zeroed result used for unevaluated descriptors, short
/// series and failed evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    /// Fraction, can be negative.
    pub total_return: f64,
    pub sharpe_ratio: f64,
    /// Non-negative fraction of the running equity peak.
    pub max_drawdown: f64,
    /// In `[0, 1]`.
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: u64,
    pub avg_trade_duration_hours: f64,
    pub volatility: f64,
    pub calmar_ratio: f64,
    pub sortino_ratio: f64,
}

impl BacktestResult {
    pub fn zeroed() -> Self {
        Self::default()
    }

    pub fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }

    /// Replace every non-finite metric with 0.
    pub fn sanitized(mut self) -> Self {
        for v in [
            &mut self.total_return,
            &mut self.sharpe_ratio,
            &mut self.max_drawdown,
            &mut self.win_rate,
            &mut self.profit_factor,
            &mut self.avg_trade_duration_hours,
            &mut self.volatility,
            &mut self.calmar_ratio,
            &mut self.sortino_ratio,
        ] {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        self
    }

    /// Range checks that hold for every result the evaluator produces.
    pub fn is_within_bounds(&self) -> bool {
        (0.0..=1.0).contains(&self.win_rate)
            && (0.0..=1.0).contains(&self.max_drawdown)
            && self.profit_factor >= 0.0
            && self.avg_trade_duration_hours >= 0.0
            && self.volatility >= 0.0
            && [
                self.total_return,
                self.sharpe_ratio,
                self.calmar_ratio,
                self.sortino_ratio,
            ]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_is_default_and_in_bounds() {
        let r = BacktestResult::zeroed();
        assert!(r.is_zeroed());
        assert!(r.is_within_bounds());
    }

    #[test]
    fn sanitized_replaces_non_finite() {
        let r = BacktestResult {
            sharpe_ratio: f64::NAN,
            calmar_ratio: f64::INFINITY,
            total_return: 0.25,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(r.sharpe_ratio, 0.0);
        assert_eq!(r.calmar_ratio, 0.0);
        assert_eq!(r.total_return, 0.25);
    }

    #[test]
    fn out_of_range_win_rate_detected() {
        let r = BacktestResult {
            win_rate: 1.5,
            ..Default::default()
        };
        assert!(!r.is_within_bounds());
    }
}
