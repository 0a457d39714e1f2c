//! Average True Range (ATR).
//!
//! True Range: max(high-low, |high-prev_close|, |low-prev_close|)
//! ATR uses Wilder smoothing: ATR[t] = (ATR[t-1] * (period - 1) + TR[t]) / period,
//! seeded with the mean of TR[1..=period]. Lookback: period.

/// TR[0] = high[0] - low[0] (no previous close).
pub fn true_range(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    let n = highs.len().min(lows.len()).min(closes.len());
    let mut tr = vec![f64::NAN; n];
    if n == 0 {
        return tr;
    }
    tr[0] = highs[0] - lows[0];
    for i in 1..n {
        let (h, l, pc) = (highs[i], lows[i], closes[i - 1]);
        tr[i] = (h - l).max((h - pc).abs()).max((l - pc).abs());
        if h.is_nan() || l.is_nan() || pc.is_nan() {
            tr[i] = f64::NAN;
        }
    }
    tr
}

pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let tr = true_range(highs, lows, closes);
    let n = tr.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || period >= n {
        return result;
    }

    let seed_window = &tr[1..=period];
    if seed_window.iter().any(|v| v.is_nan()) {
        return result;
    }
    let mut prev = seed_window.iter().sum::<f64>() / period as f64;
    result[period] = prev;

    let p = period as f64;
    for i in (period + 1)..n {
        if tr[i].is_nan() {
            return result;
        }
        prev = (prev * (p - 1.0) + tr[i]) / p;
        result[i] = prev;
    }
    result
}
