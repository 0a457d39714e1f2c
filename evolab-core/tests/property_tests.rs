//! Property tests for evaluator and indicator invariants.
//!
//! 1. Evaluator output bounds: win rate and drawdown in [0, 1], finite metrics
//! 2. Evaluator determinism: identical inputs give bit-identical results
//! 3. Fitness is always finite and non-negative
//! 4. Indicators preserve length; RSI stays in [0, 100]

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use evolab_core::backtest::metrics::max_drawdown;
use evolab_core::domain::{
    BacktestResult, OhlcvBar, OhlcvSeries, Origin, Provenance, StrategyDescriptor, StrategyKind,
};
use evolab_core::indicators::{bollinger, ema, macd, rsi, sma};
use evolab_core::{BacktestEvaluator, FitnessWeights, ParameterSchema, ParameterSet, MIN_BARS};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_closes(min_len: usize, max_len: usize) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-0.08..0.08_f64, min_len..max_len).prop_map(|steps| {
        let mut price = 100.0;
        steps
            .into_iter()
            .map(|s| {
                price *= 1.0 + s;
                price
            })
            .collect()
    })
}

fn arb_kind() -> impl Strategy<Value = StrategyKind> {
    prop::sample::select(StrategyKind::ALL.to_vec())
}

fn arb_unit_params() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.0..=1.0_f64, 8)
}

fn schema() -> ParameterSchema {
    ParameterSchema::from_ranges(&ParameterSchema::default_ranges()).unwrap()
}

/// Map unit-interval draws onto the schema ranges.
fn params_in_schema(schema: &ParameterSchema, unit: &[f64]) -> ParameterSet {
    ParameterSet(
        schema
            .specs()
            .iter()
            .zip(unit)
            .map(|(s, u)| s.min + u * s.span())
            .collect(),
    )
}

fn series_from(closes: &[f64]) -> OhlcvSeries {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    OhlcvSeries::new(
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| OhlcvBar {
                timestamp: start + Duration::hours(i as i64),
                open: c,
                high: c * 1.01,
                low: c * 0.99,
                close: c,
                volume: 1.0,
            })
            .collect(),
    )
}

fn descriptor(kind: StrategyKind, params: ParameterSet) -> StrategyDescriptor {
    StrategyDescriptor::new(
        kind,
        params,
        Provenance {
            origin: Origin::Genesis,
            generation: 0,
            slot: 0,
            parents: &[],
            nonce: 0,
        },
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    )
}

fn bits(r: &BacktestResult) -> Vec<u64> {
    vec![
        r.total_return.to_bits(),
        r.sharpe_ratio.to_bits(),
        r.max_drawdown.to_bits(),
        r.win_rate.to_bits(),
        r.profit_factor.to_bits(),
        r.total_trades,
        r.avg_trade_duration_hours.to_bits(),
        r.volatility.to_bits(),
        r.calmar_ratio.to_bits(),
        r.sortino_ratio.to_bits(),
    ]
}

// ── 1 & 2. Evaluator ─────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn evaluator_results_within_bounds(
        closes in arb_closes(MIN_BARS, 300),
        kind in arb_kind(),
        unit in arb_unit_params(),
    ) {
        let schema = schema();
        let d = descriptor(kind, params_in_schema(&schema, &unit));
        let r = BacktestEvaluator::default().evaluate(&d, &schema, &series_from(&closes));
        prop_assert!(r.is_within_bounds(), "{:?}", r);
        prop_assert!((0.0..=1.0).contains(&r.win_rate));
        prop_assert!((0.0..=1.0).contains(&r.max_drawdown));
    }

    #[test]
    fn evaluator_is_deterministic(
        closes in arb_closes(MIN_BARS, 200),
        kind in arb_kind(),
        unit in arb_unit_params(),
    ) {
        let schema = schema();
        let d = descriptor(kind, params_in_schema(&schema, &unit));
        let series = series_from(&closes);
        let eval = BacktestEvaluator::default();
        prop_assert_eq!(
            bits(&eval.evaluate(&d, &schema, &series)),
            bits(&eval.evaluate(&d, &schema, &series))
        );
    }

    #[test]
    fn short_series_always_zeroed(
        closes in arb_closes(1, MIN_BARS),
        kind in arb_kind(),
    ) {
        let schema = schema();
        let d = descriptor(kind, schema.sample(&mut evolab_core::RngHierarchy::new(1).rng_for("t", 0)));
        let r = BacktestEvaluator::default().evaluate(&d, &schema, &series_from(&closes));
        prop_assert!(r.is_zeroed());
    }
}

// ── 3. Fitness ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn fitness_non_negative(
        total_return in -10.0..10.0_f64,
        sharpe in -50.0..50.0_f64,
        dd in 0.0..=1.0_f64,
        w in prop::collection::vec(0.0..5.0_f64, 4),
    ) {
        let weights = FitnessWeights {
            return_weight: w[0],
            risk_weight: w[1],
            sharpe_weight: w[2],
            drawdown_weight: w[3],
        };
        let r = BacktestResult {
            total_return,
            sharpe_ratio: sharpe,
            max_drawdown: dd,
            total_trades: 1,
            ..Default::default()
        };
        let f = weights.score(&r);
        prop_assert!(f.is_finite());
        prop_assert!(f >= 0.0);
    }

    #[test]
    fn drawdown_is_unit_fraction(equity in prop::collection::vec(1.0..1e6_f64, 0..200)) {
        let dd = max_drawdown(&equity);
        prop_assert!((0.0..=1.0).contains(&dd));
    }
}

// ── 4. Indicators ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn indicators_preserve_length(closes in arb_closes(0, 150), period in 2usize..40) {
        let n = closes.len();
        prop_assert_eq!(sma(&closes, period).len(), n);
        prop_assert_eq!(ema(&closes, period).len(), n);
        prop_assert_eq!(rsi(&closes, period).len(), n);
        prop_assert_eq!(macd(&closes).histogram.len(), n);
        prop_assert_eq!(bollinger(&closes, period, 2.0).lower.len(), n);
    }

    #[test]
    fn rsi_bounded(closes in arb_closes(3, 200), period in 2usize..30) {
        for v in rsi(&closes, period).into_iter().filter(|v| !v.is_nan()) {
            prop_assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn too_short_input_is_all_nan(closes in arb_closes(0, 10), period in 11usize..30) {
        prop_assert!(sma(&closes, period).iter().all(|v| v.is_nan()));
        prop_assert!(ema(&closes, period).iter().all(|v| v.is_nan()));
        prop_assert!(rsi(&closes, period).iter().all(|v| v.is_nan()));
    }
}
