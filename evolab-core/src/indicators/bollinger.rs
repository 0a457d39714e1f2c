//! Bollinger Bands: moving average +/- standard deviation multiplier.
//!
//! - Middle: SMA(close, period)
//! - Upper: middle + k * stddev(close, period)
//! - Lower: middle - k * stddev(close, period)
//!
//! Uses sample stddev (divide by N - 1), so `period` must be at least 2.
//! Lookback: period - 1.

use super::sma::sma;

#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger(closes: &[f64], period: usize, k: f64) -> BollingerBands {
    let n = closes.len();
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    if period < 2 || n < period {
        return BollingerBands {
            upper,
            middle: vec![f64::NAN; n],
            lower,
        };
    }

    let middle = sma(closes, period);
    for i in (period - 1)..n {
        let mean = middle[i];
        if mean.is_nan() {
            continue;
        }
        let window = &closes[i + 1 - period..=i];
        let var = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (period - 1) as f64;
        let std = var.sqrt();
        upper[i] = mean + k * std;
        lower[i] = mean - k * std;
    }

    BollingerBands {
        upper,
        middle,
        lower,
    }
}
