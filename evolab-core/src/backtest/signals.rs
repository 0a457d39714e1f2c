//! Kind-specific signal generation.
//!
//! Each generator returns one signal per bar: `+1` go long, `-1` exit,
//! `0` hold. Undefined indicator positions compare false and yield `0`.

use crate::domain::StrategyKind;
use crate::indicators::{bollinger, macd, rsi, sma};
use crate::schema::{ParameterSchema, ParameterSet};

pub type Signal = i8;

pub const LONG: Signal = 1;
pub const EXIT: Signal = -1;
pub const HOLD: Signal = 0;

const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;

/// Upper bound for any resolved period or grid level count.
pub const MAX_PERIOD: usize = 100_000;

/// Indicator settings resolved from a descriptor's parameters.
///
/// Names missing from the schema fall back to the defaults below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalParams {
    pub rsi_period: usize,
    pub ma_short: usize,
    pub ma_long: usize,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub arbitrage_threshold: f64,
    pub grid_levels: usize,
}

impl Default for SignalParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            ma_short: 10,
            ma_long: 30,
            bollinger_period: 20,
            bollinger_std: 2.0,
            arbitrage_threshold: 0.02,
            grid_levels: 10,
        }
    }
}

impl SignalParams {
    pub fn resolve(schema: &ParameterSchema, params: &ParameterSet) -> Self {
        let d = Self::default();
        let lookup = |name: &str| params.get(schema, name).filter(|v| v.is_finite());
        let period = |name: &str, fallback: usize| {
            lookup(name).map_or(fallback, |v| {
                v.round().clamp(2.0, MAX_PERIOD as f64) as usize
            })
        };
        Self {
            rsi_period: period("rsi_period", d.rsi_period),
            ma_short: period("ma_short", d.ma_short),
            ma_long: period("ma_long", d.ma_long),
            bollinger_period: period("bollinger_period", d.bollinger_period),
            bollinger_std: lookup("bollinger_std").unwrap_or(d.bollinger_std),
            arbitrage_threshold: lookup("arbitrage_threshold")
                .map_or(d.arbitrage_threshold, f64::abs),
            grid_levels: period("grid_levels", d.grid_levels),
        }
    }
}

pub fn generate_signals(kind: StrategyKind, closes: &[f64], params: &SignalParams) -> Vec<Signal> {
    match kind {
        StrategyKind::TrendFollowing => trend_following(closes, params),
        StrategyKind::MeanReversion => mean_reversion(closes, params),
        StrategyKind::Arbitrage => arbitrage(closes, params.arbitrage_threshold),
        StrategyKind::GridTrading => grid(closes, params.grid_levels),
        StrategyKind::Hybrid => hybrid(closes, params),
    }
}

/// Long when the short MA is above the long MA and MACD is above its
/// signal line; exit when both are reversed.
pub fn trend_following(closes: &[f64], params: &SignalParams) -> Vec<Signal> {
    let fast = sma(closes, params.ma_short);
    let slow = sma(closes, params.ma_long);
    let m = macd(closes);
    (0..closes.len())
        .map(|i| {
            if fast[i] > slow[i] && m.line[i] > m.signal[i] {
                LONG
            } else if fast[i] < slow[i] && m.line[i] < m.signal[i] {
                EXIT
            } else {
                HOLD
            }
        })
        .collect()
}

/// Long below the lower band or when oversold; exit above the upper band or
/// when overbought. Conflicting conditions on the same bar hold.
pub fn mean_reversion(closes: &[f64], params: &SignalParams) -> Vec<Signal> {
    let bands = bollinger(closes, params.bollinger_period, params.bollinger_std);
    let strength = rsi(closes, params.rsi_period);
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let long = c < bands.lower[i] || strength[i] < RSI_OVERSOLD;
            let short = c > bands.upper[i] || strength[i] > RSI_OVERBOUGHT;
            match (long, short) {
                (true, false) => LONG,
                (false, true) => EXIT,
                _ => HOLD,
            }
        })
        .collect()
}

/// Single-bar return threshold crossing: a drop beyond the threshold goes
/// long, a jump beyond it exits.
pub fn arbitrage(closes: &[f64], threshold: f64) -> Vec<Signal> {
    let mut out = vec![HOLD; closes.len()];
    for i in 1..closes.len() {
        let prev = closes[i - 1];
        if prev <= 0.0 {
            continue;
        }
        let change = closes[i] / prev - 1.0;
        if change > threshold {
            out[i] = EXIT;
        } else if -change > threshold {
            out[i] = LONG;
        }
    }
    out
}

/// `levels` equal price bands over the close range. Moving down a band goes
/// long, moving up a band exits.
pub fn grid(closes: &[f64], levels: usize) -> Vec<Signal> {
    let mut out = vec![HOLD; closes.len()];
    if closes.len() < 2 || levels == 0 {
        return out;
    }
    let lo = closes.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = closes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let step = (hi - lo) / levels as f64;
    if !(step.is_finite() && step > 0.0) {
        return out;
    }
    let level = |c: f64| (((c - lo) / step).floor() as usize).min(levels - 1);
    let mut prev = level(closes[0]);
    for (i, &c) in closes.iter().enumerate().skip(1) {
        let cur = level(c);
        if cur < prev {
            out[i] = LONG;
        } else if cur > prev {
            out[i] = EXIT;
        }
        prev = cur;
    }
    out
}

/// Mean of the trend and reversion signals rounded half-to-even: only a
/// bar where both agree produces a signal.
pub fn hybrid(closes: &[f64], params: &SignalParams) -> Vec<Signal> {
    let trend = trend_following(closes, params);
    let reversion = mean_reversion(closes, params);
    trend
        .iter()
        .zip(&reversion)
        .map(|(t, r)| match t + r {
            2 => LONG,
            -2 => EXIT,
            _ => HOLD,
        })
        .collect()
}
