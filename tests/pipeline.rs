use chrono::{Datelike, Duration, NaiveDate, Weekday};
use quant_engine::calendar::RebalancingFrequency;
use quant_engine::config::{EngineRuntimeSettings, StrategyAllocation, StrategyConfig};
use quant_engine::engine::{BacktestEngine, EngineState};
use quant_engine::models::{BacktestResult, TradeAction};
use quant_engine::panel::{InMemoryDataProvider, PriceBar};
use quant_engine::strategy::StrategyRegistry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Once;

const SYMBOLS: [&str; 6] = ["AAA", "BBB", "CCC", "DDD", "EEE", "FFF"];
const TOTAL_DAYS: i64 = 730;

static INIT_LOGGER: Once = Once::new();

fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// Weekday-only random walks with per-symbol drift plus a slowly moving PER.
fn synthetic_rows(seed: u64) -> Vec<PriceBar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = date(2022, 1, 3);
    let mut closes: Vec<f64> = SYMBOLS.iter().map(|_| rng.gen_range(20.0..200.0)).collect();
    let drifts: Vec<f64> = (0..SYMBOLS.len())
        .map(|idx| 0.0004 * (idx as f64 - 2.0))
        .collect();
    let mut rows = Vec::new();
    for offset in 0..TOTAL_DAYS {
        let day = start + Duration::days(offset);
        if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            continue;
        }
        for (idx, symbol) in SYMBOLS.iter().enumerate() {
            let shock: f64 = rng.gen_range(-0.02..0.02);
            closes[idx] = (closes[idx] * (1.0 + drifts[idx] + shock)).max(1.0);
            let close = closes[idx];
            let per = 8.0 + 4.0 * idx as f64 + rng.gen_range(-1.0..1.0);
            rows.push(
                PriceBar::new(day, *symbol, close, close * 1.01, close * 0.99, close, 1e6)
                    .with_fundamental("per", per),
            );
        }
    }
    rows
}

fn config(strategies: &[(&str, f64)]) -> StrategyConfig {
    let allocations = strategies
        .iter()
        .map(|(name, weight)| StrategyAllocation {
            name: name.to_string(),
            weight: *weight,
        })
        .collect();
    let mut config = StrategyConfig::new(1_000_000.0, date(2022, 6, 1), date(2023, 11, 30), allocations);
    config.rebalancing_freq = RebalancingFrequency::Quarterly;
    config.max_positions = 4;
    config.max_position_size = 0.3;
    config
}

fn run(config: &StrategyConfig, seed: u64) -> (Option<BacktestResult>, EngineState) {
    init_logger();
    let provider = InMemoryDataProvider::from_rows(synthetic_rows(seed)).unwrap();
    let registry = StrategyRegistry::with_builtin();
    let mut engine = BacktestEngine::new(&provider, &registry, EngineRuntimeSettings::default());
    let result = engine.run_backtest(config);
    (result, engine.state())
}

fn assert_consistent(result: &BacktestResult) {
    assert!(!result.portfolio_value_history.is_empty());
    let mut previous = None;
    for snapshot in &result.portfolio_value_history {
        let held: f64 = snapshot
            .positions
            .iter()
            .map(|p| p.shares as f64 * p.current_price)
            .sum();
        assert!(
            (snapshot.total_value - (snapshot.cash + held)).abs() < 1e-6,
            "snapshot on {} does not reconcile",
            snapshot.date
        );
        assert!(snapshot.cash > -1e-6);
        assert_eq!(snapshot.position_count, snapshot.positions.len());
        if let Some(prev) = previous {
            assert!(snapshot.date > prev);
        }
        previous = Some(snapshot.date);
    }
    assert_eq!(
        result.metric("total_trades"),
        Some(result.trade_history.len() as f64)
    );
    let buys = result
        .trade_history
        .iter()
        .filter(|t| t.action == TradeAction::Buy)
        .count();
    assert_eq!(result.metric("buy_trades"), Some(buys as f64));
    assert!(
        (result.final_portfolio_value
            - result.portfolio_value_history.last().unwrap().total_value)
            .abs()
            < 1e-9
    );
}

#[test]
fn momentum_backtest_runs_end_to_end() {
    let config = config(&[("momentum", 1.0)]);
    let (result, state) = run(&config, 7);
    let result = result.expect("backtest result");

    assert_eq!(state, EngineState::Complete);
    assert_consistent(&result);
    assert!(!result.trade_history.is_empty());
    assert_eq!(result.start_date, date(2022, 6, 1));
    assert_eq!(result.end_date, date(2023, 11, 30));
    for key in [
        "total_return",
        "sharpe_ratio",
        "sortino_ratio",
        "max_drawdown",
        "var_95",
        "monthly_mean_return",
        "rebalance_count",
    ] {
        assert!(result.metric(key).is_some(), "missing {}", key);
    }
    assert!(result.metric("max_drawdown").unwrap() <= 0.0);
    assert!(result.execution_time >= 0.0);
    assert!(!result.id.is_empty());
}

#[test]
fn combined_strategies_respect_position_limits() {
    let config = config(&[("buy_and_hold", 1.0), ("low_per", 1.0)]);
    let (result, _) = run(&config, 11);
    let result = result.expect("backtest result");

    assert_consistent(&result);
    let first = &result.portfolio_value_history[0];
    assert!(first.position_count <= config.max_positions);
    for position in &first.positions {
        assert!(position.weight <= config.max_position_size + 1e-3);
    }
}

#[test]
fn weighting_method_from_json_config() {
    let json = r#"{
        "investment_amount": 250000,
        "start_date": "2022-06-01",
        "end_date": "2023-06-30",
        "rebalancing_freq": "monthly",
        "transaction_cost": 0.0005,
        "max_positions": 6,
        "max_position_size": 0.5,
        "strategies": [{"name": "buy_and_hold", "weight": 1.0}],
        "weighting_method": "inverse_volatility",
        "benchmark_symbol": "AAA"
    }"#;
    let config = StrategyConfig::from_json(json).unwrap();
    let (result, _) = run(&config, 3);
    let result = result.expect("backtest result");

    assert_consistent(&result);
    assert!(result.metric("benchmark_beta").is_some());
    assert!(result.metric("benchmark_common_periods").unwrap() > 100.0);
    let commission = result.metric("total_commission").unwrap();
    let summed: f64 = result.trade_history.iter().map(|t| t.commission).sum();
    assert!((commission - summed).abs() < 1e-6);
}

#[test]
fn single_asset_benchmark_tracks_itself() {
    let mut config = config(&[("buy_and_hold", 1.0)]);
    config.max_position_size = 1.0;
    config.benchmark_symbol = Some("AAA".to_string());
    let rows: Vec<PriceBar> = synthetic_rows(5)
        .into_iter()
        .filter(|row| row.symbol == "AAA")
        .collect();
    let provider = InMemoryDataProvider::from_rows(rows).unwrap();
    let registry = StrategyRegistry::with_builtin();
    let mut engine = BacktestEngine::new(&provider, &registry, EngineRuntimeSettings::default());
    let result = engine.run_backtest(&config).expect("backtest result");

    let beta = result.metric("benchmark_beta").unwrap();
    assert!(beta > 0.8 && beta < 1.1, "beta {}", beta);
    assert!(result.metric("benchmark_correlation").unwrap() > 0.95);
}

#[test]
fn data_outside_range_yields_no_result() {
    let mut config = config(&[("buy_and_hold", 1.0)]);
    config.start_date = date(2030, 1, 1);
    config.end_date = date(2030, 12, 31);
    let (result, state) = run(&config, 1);
    assert!(result.is_none());
    assert_eq!(state, EngineState::Failed);
}

#[test]
fn unknown_strategy_yields_no_result() {
    let config = config(&[("buy_and_hold", 0.5), ("crystal_ball", 0.5)]);
    let (result, state) = run(&config, 1);
    assert!(result.is_none());
    assert_eq!(state, EngineState::Failed);
}

#[test]
fn malformed_config_yields_no_result() {
    let mut config = config(&[("buy_and_hold", 1.0)]);
    config.end_date = date(2021, 1, 1);
    let (result, state) = run(&config, 1);
    assert!(result.is_none());
    assert_eq!(state, EngineState::Failed);
}

#[test]
fn runs_are_deterministic_for_the_same_panel() {
    let config = config(&[("momentum", 0.6), ("risk_parity", 0.4)]);
    let (first, _) = run(&config, 21);
    let (second, _) = run(&config, 21);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.trade_history, second.trade_history);
    assert_eq!(first.value_series(), second.value_series());
    assert_eq!(first.performance_summary, second.performance_summary);
}
