//! Performance metrics: pure functions over an equity curve and closed trades.
//!
//! Returns are bar-to-bar; annualization uses sqrt(252) regardless of the bar
//! interval. Standard deviations are sample (N - 1).

use super::evaluator::ClosedTrade;

pub const ANNUALIZATION: f64 = 252.0;

/// Upper bound for profit factor when there are gains and no losses.
pub const PROFIT_FACTOR_CAP: f64 = 1e6;

const STD_EPSILON: f64 = 1e-15;

/// Bar-to-bar returns: `equity[t] / equity[t-1] - 1`.
pub fn bar_returns(equity_curve: &[f64]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map(|w| if w[0] > 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

pub fn total_return(equity_curve: &[f64], initial_capital: f64) -> f64 {
    match equity_curve.last() {
        Some(&last) if initial_capital > 0.0 => (last - initial_capital) / initial_capital,
        _ => 0.0,
    }
}

/// Annualized Sharpe ratio; 0 when the deviation vanishes.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    let std = std_dev(returns);
    if std < STD_EPSILON {
        return 0.0;
    }
    mean(returns) / std * ANNUALIZATION.sqrt()
}

/// Annualized Sortino ratio over the deviation of negative returns only.
pub fn sortino_ratio(returns: &[f64]) -> f64 {
    let negatives: Vec<f64> = returns.iter().copied().filter(|&r| r < 0.0).collect();
    let downside = std_dev(&negatives);
    if downside < STD_EPSILON {
        return 0.0;
    }
    mean(returns) / downside * ANNUALIZATION.sqrt()
}

pub fn volatility(returns: &[f64]) -> f64 {
    std_dev(returns) * ANNUALIZATION.sqrt()
}

/// Largest peak-to-trough decline as a positive fraction in `[0, 1]`.
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for &eq in equity_curve {
        peak = peak.max(eq);
        if peak > 0.0 {
            worst = worst.max((peak - eq) / peak);
        }
    }
    worst.clamp(0.0, 1.0)
}

pub fn calmar_ratio(total_return: f64, max_drawdown: f64) -> f64 {
    if max_drawdown == 0.0 {
        0.0
    } else {
        total_return / max_drawdown
    }
}

pub fn win_rate(trades: &[ClosedTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().filter(|t| t.pnl > 0.0).count() as f64 / trades.len() as f64
}

/// Gross gains over gross losses, capped at [`PROFIT_FACTOR_CAP`].
pub fn profit_factor(trades: &[ClosedTrade]) -> f64 {
    let gains: f64 = trades.iter().map(|t| t.pnl).filter(|&p| p > 0.0).sum();
    let losses: f64 = trades.iter().map(|t| t.pnl).filter(|&p| p < 0.0).map(f64::abs).sum();
    if losses == 0.0 {
        return if gains > 0.0 { PROFIT_FACTOR_CAP } else { 0.0 };
    }
    (gains / losses).min(PROFIT_FACTOR_CAP)
}

pub fn avg_trade_duration_hours(trades: &[ClosedTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let total: f64 = trades
        .iter()
        .map(|t| (t.exit_time - t.entry_time).num_seconds() as f64 / 3600.0)
        .sum();
    total / trades.len() as f64
}

// ─── Helpers ────────────────────────────────────────────────────────

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; 0 for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
