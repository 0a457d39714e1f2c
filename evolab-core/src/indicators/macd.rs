//! Moving Average Convergence Divergence (MACD).
//!
//! line = EMA(fast) - EMA(slow); signal = EMA(signal_period) of line;
//! histogram = line - signal. Standard periods: 12 / 26 / 9.

use super::ema::ema;

pub const FAST_PERIOD: usize = 12;
pub const SLOW_PERIOD: usize = 26;
pub const SIGNAL_PERIOD: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct Macd {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// MACD with the standard 12 / 26 / 9 periods.
pub fn macd(closes: &[f64]) -> Macd {
    macd_with(closes, FAST_PERIOD, SLOW_PERIOD, SIGNAL_PERIOD)
}

pub fn macd_with(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Macd {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);
    let line: Vec<f64> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| f - s)
        .collect();
    let signal = ema(&line, signal_period);
    let histogram = line.iter().zip(&signal).map(|(l, s)| l - s).collect();
    Macd {
        line,
        signal,
        histogram,
    }
}
