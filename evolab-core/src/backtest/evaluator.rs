//! Backtest evaluator: replays kind-specific signals through a single
//! fully-invested long-or-flat position.
//!
//! At each bar `t >= 1`: a long signal while flat buys at the close, an exit
//! signal while long sells at the close, anything else holds. Equity is
//! `cash + quantity * close`. A position still open on the last bar is marked
//! to market but not counted as a closed trade.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::metrics;
use super::signals::{generate_signals, SignalParams, EXIT, LONG};
use crate::domain::{BacktestResult, OhlcvSeries, StrategyDescriptor};
use crate::schema::{ParameterSchema, SchemaError};

/// Series shorter than this produce a zeroed result.
pub const MIN_BARS: usize = 50;

pub const DEFAULT_INITIAL_CAPITAL: f64 = 10_000.0;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluationError {
    #[error("series has {found} bars, need at least {required}")]
    InsufficientBars { found: usize, required: usize },

    #[error("bar {index} has a non-finite or non-positive close")]
    InvalidBar { index: usize },

    #[error("bar timestamps are not strictly ascending at index {index}")]
    Unordered { index: usize },

    #[error("initial capital must be positive and finite, got {0}")]
    InvalidCapital(f64),

    #[error("descriptor parameters do not match the schema: {0}")]
    Parameters(#[from] SchemaError),
}

/// A round trip from entry to exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub entry_index: usize,
    pub exit_index: usize,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
}

/// Full output of one simulation, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRun {
    pub result: BacktestResult,
    pub equity_curve: Vec<f64>,
    pub trades: Vec<ClosedTrade>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacktestEvaluator {
    initial_capital: f64,
}

impl Default for BacktestEvaluator {
    fn default() -> Self {
        Self {
            initial_capital: DEFAULT_INITIAL_CAPITAL,
        }
    }
}

impl BacktestEvaluator {
    pub fn new(initial_capital: f64) -> Self {
        Self { initial_capital }
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    /// Evaluate and collapse every error into the zeroed result.
    pub fn evaluate(
        &self,
        descriptor: &StrategyDescriptor,
        schema: &ParameterSchema,
        series: &OhlcvSeries,
    ) -> BacktestResult {
        self.try_evaluate(descriptor, schema, series)
            .unwrap_or_default()
    }

    pub fn try_evaluate(
        &self,
        descriptor: &StrategyDescriptor,
        schema: &ParameterSchema,
        series: &OhlcvSeries,
    ) -> Result<BacktestResult, EvaluationError> {
        self.try_run(descriptor, schema, series).map(|run| run.result)
    }

    pub fn try_run(
        &self,
        descriptor: &StrategyDescriptor,
        schema: &ParameterSchema,
        series: &OhlcvSeries,
    ) -> Result<BacktestRun, EvaluationError> {
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(EvaluationError::InvalidCapital(self.initial_capital));
        }
        descriptor.parameters.validate(schema)?;
        validate_series(series)?;

        let closes = series.closes();
        let params = SignalParams::resolve(schema, &descriptor.parameters);
        let signals = generate_signals(descriptor.kind, &closes, &params);
        Ok(self.simulate(series, &closes, &signals))
    }

    fn simulate(&self, series: &OhlcvSeries, closes: &[f64], signals: &[i8]) -> BacktestRun {
        let n = closes.len();
        let mut cash = self.initial_capital;
        let mut quantity = 0.0;
        let mut entry: Option<(usize, f64)> = None;
        let mut trades = Vec::new();
        let mut equity_curve = Vec::with_capacity(n);
        equity_curve.push(self.initial_capital);

        for t in 1..n {
            let close = closes[t];
            match (signals[t], entry) {
                (LONG, None) => {
                    quantity = cash / close;
                    cash = 0.0;
                    entry = Some((t, close));
                }
                (EXIT, Some((entry_index, entry_price))) => {
                    cash = quantity * close;
                    trades.push(ClosedTrade {
                        entry_index,
                        exit_index: t,
                        entry_time: series.bars[entry_index].timestamp,
                        exit_time: series.bars[t].timestamp,
                        entry_price,
                        exit_price: close,
                        quantity,
                        pnl: quantity * (close - entry_price),
                    });
                    quantity = 0.0;
                    entry = None;
                }
                _ => {}
            }
            equity_curve.push(cash + quantity * close);
        }

        let returns = metrics::bar_returns(&equity_curve);
        let total_return = metrics::total_return(&equity_curve, self.initial_capital);
        let max_drawdown = metrics::max_drawdown(&equity_curve);
        let result = BacktestResult {
            total_return,
            sharpe_ratio: metrics::sharpe_ratio(&returns),
            max_drawdown,
            win_rate: metrics::win_rate(&trades),
            profit_factor: metrics::profit_factor(&trades),
            total_trades: trades.len() as u64,
            avg_trade_duration_hours: metrics::avg_trade_duration_hours(&trades),
            volatility: metrics::volatility(&returns),
            calmar_ratio: metrics::calmar_ratio(total_return, max_drawdown),
            sortino_ratio: metrics::sortino_ratio(&returns),
        }
        .sanitized();

        BacktestRun {
            result,
            equity_curve,
            trades,
        }
    }
}

fn validate_series(series: &OhlcvSeries) -> Result<(), EvaluationError> {
    if series.len() < MIN_BARS {
        return Err(EvaluationError::InsufficientBars {
            found: series.len(),
            required: MIN_BARS,
        });
    }
    for (index, bar) in series.bars.iter().enumerate() {
        if !(bar.close.is_finite() && bar.close > 0.0) {
            return Err(EvaluationError::InvalidBar { index });
        }
        if index > 0 && bar.timestamp <= series.bars[index - 1].timestamp {
            return Err(EvaluationError::Unordered { index });
        }
    }
    Ok(())
}
