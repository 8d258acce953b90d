use crate::calendar::{is_near_anchor, rebalancing_dates};
use crate::config::{EngineRuntimeSettings, StrategyConfig, WeightingMethod};
use crate::error::EngineError;
use crate::models::{BacktestResult, DatedSeries, Signal, SignalAction, WeightMap};
use crate::optimizer::{OptimizerSettings, PortfolioOptimizer, RiskParityMethod};
use crate::panel::{DataProvider, PanelWindow, PricePanel};
use crate::performance::PerformanceCalculator;
use crate::portfolio::{Portfolio, PortfolioLimits};
use crate::strategy::{Strategy, StrategyRegistry};
use crate::strategy_utils::top_n_by_score;
use chrono::{Duration, NaiveDate};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    DataLoaded,
    Running,
    Complete,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Init => "init",
            EngineState::DataLoaded => "data_loaded",
            EngineState::Running => "running",
            EngineState::Complete => "complete",
            EngineState::Failed => "failed",
        };
        f.write_str(label)
    }
}

struct LoopOutcome {
    portfolio: Portfolio,
    rebalance_count: usize,
    skipped_rebalances: usize,
}

/// Drives the day-by-day simulation for one configuration at a time.
pub struct BacktestEngine<'a> {
    provider: &'a dyn DataProvider,
    registry: &'a StrategyRegistry,
    settings: EngineRuntimeSettings,
    optimizer: PortfolioOptimizer,
    calculator: PerformanceCalculator,
    state: EngineState,
}

impl<'a> BacktestEngine<'a> {
    pub fn new(
        provider: &'a dyn DataProvider,
        registry: &'a StrategyRegistry,
        settings: EngineRuntimeSettings,
    ) -> Self {
        let optimizer = PortfolioOptimizer::new(OptimizerSettings::from(&settings));
        let calculator = PerformanceCalculator::new(settings.risk_free_rate);
        Self {
            provider,
            registry,
            settings,
            optimizer,
            calculator,
            state: EngineState::Init,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn settings(&self) -> &EngineRuntimeSettings {
        &self.settings
    }

    fn transition(&mut self, next: EngineState) {
        debug!("Engine state {} -> {}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: impl fmt::Display) -> Option<BacktestResult> {
        warn!("Backtest aborted: {}", error);
        self.transition(EngineState::Failed);
        None
    }

    /// Runs the combined strategy named by `config.strategies`. Every failure
    /// before the simulation loop (bad configuration, unknown strategy, no
    /// data) yields `None` and leaves the engine in [`EngineState::Failed`].
    pub fn run_backtest(&mut self, config: &StrategyConfig) -> Option<BacktestResult> {
        self.state = EngineState::Init;
        if let Err(error) = config.validate() {
            return self.fail(EngineError::InvalidConfig(error.to_string()));
        }
        let strategy = match self.registry.build_combined(config, self.optimizer.settings()) {
            Ok(strategy) => strategy,
            Err(error) => return self.fail(error),
        };
        debug!("Strategy allocations: {:?}", strategy.allocations());
        self.run_with_strategy(config, &strategy)
    }

    /// Same as [`run_backtest`](Self::run_backtest) with an explicit strategy
    /// instead of the registry lookup.
    pub fn run_with_strategy(
        &mut self,
        config: &StrategyConfig,
        strategy: &dyn Strategy,
    ) -> Option<BacktestResult> {
        let started = Instant::now();
        self.state = EngineState::Init;
        if let Err(error) = config.validate() {
            return self.fail(EngineError::InvalidConfig(error.to_string()));
        }

        let panel = match self.load_panel(config) {
            Ok(panel) => panel,
            Err(error) => return self.fail(error),
        };
        self.transition(EngineState::DataLoaded);

        info!(
            "Starting {} backtest {} -> {} with {} ({} symbols, {} trading days incl. lookback)",
            config.rebalancing_freq.label(),
            config.start_date,
            config.end_date,
            strategy.name(),
            panel.symbols().len(),
            panel.trading_dates().len()
        );

        self.transition(EngineState::Running);
        let outcome = self.simulate(config, strategy, &panel);
        let result = self.build_result(config, &panel, outcome, started);
        self.transition(EngineState::Complete);

        info!(
            "Backtest finished in {:.3}s: final value {:.2} ({} trades)",
            result.execution_time,
            result.final_portfolio_value,
            result.trade_history.len()
        );
        Some(result)
    }

    /// Loads `[start - lookback, end]` and checks that at least one trading
    /// day falls inside the simulated range.
    fn load_panel(&self, config: &StrategyConfig) -> Result<PricePanel, EngineError> {
        let load_start =
            config.start_date - Duration::days(self.settings.lookback_calendar_days as i64);
        let panel = self.provider.load_panel(load_start, config.end_date)?;
        if simulated_dates(&panel, config.start_date, config.end_date).is_empty() {
            return Err(EngineError::EmptyPanel {
                start: config.start_date,
                end: config.end_date,
            });
        }
        Ok(panel)
    }

    fn simulate(
        &self,
        config: &StrategyConfig,
        strategy: &dyn Strategy,
        panel: &PricePanel,
    ) -> LoopOutcome {
        let mut portfolio = Portfolio::new(config.investment_amount, config.transaction_cost)
            .with_limits(PortfolioLimits::from(config));
        let anchors = rebalancing_dates(config.start_date, config.end_date, config.rebalancing_freq);
        let mut last_prices: HashMap<String, f64> = HashMap::new();
        let mut rebalance_count = 0;
        let mut skipped_rebalances = 0;
        let mut first_day = true;

        for &date in panel.trading_dates() {
            if date > config.end_date {
                break;
            }
            // Carry the most recent close forward; nothing dated after `date` is seen.
            for bar in panel.bars_on(date) {
                if bar.close.is_finite() && bar.close > 0.0 {
                    last_prices.insert(bar.symbol.clone(), bar.close);
                }
            }
            if date < config.start_date {
                continue;
            }

            if first_day || is_near_anchor(date, &anchors) {
                first_day = false;
                let window = panel.window(date, self.settings.lookback_calendar_days);
                if window.trading_days() < self.settings.min_lookback_rows {
                    debug!(
                        "Skipping rebalance on {}: {} trading days in lookback, need {}",
                        date,
                        window.trading_days(),
                        self.settings.min_lookback_rows
                    );
                    skipped_rebalances += 1;
                } else {
                    let signals = strategy.generate_signals(&window);
                    let targets = self.target_positions(
                        config,
                        strategy,
                        &signals,
                        &window,
                        &portfolio,
                        &last_prices,
                    );
                    let executed = portfolio.rebalance_to_target(date, &targets, &last_prices);
                    debug!(
                        "Rebalanced on {}: {} signals, {} targets, {} trades",
                        date,
                        signals.len(),
                        targets.len(),
                        executed
                    );
                    for warning in portfolio.validate_portfolio_constraints(&last_prices) {
                        warn!("{}: {}", date, warning);
                    }
                    rebalance_count += 1;
                }
            }

            portfolio.record_snapshot(date, &last_prices);
        }

        LoopOutcome {
            portfolio,
            rebalance_count,
            skipped_rebalances,
        }
    }

    /// Integer share targets for one rebalance. Buys get
    /// `floor(weight * total_value / price)` after the weighting method, the
    /// single-position cap and the position-count limit are applied; holds keep
    /// their shares; everything else held goes to zero.
    fn target_positions(
        &self,
        config: &StrategyConfig,
        strategy: &dyn Strategy,
        signals: &[Signal],
        window: &PanelWindow<'_>,
        portfolio: &Portfolio,
        prices: &HashMap<String, f64>,
    ) -> BTreeMap<String, u64> {
        let weights = self.apply_weighting(
            config.weighting_method,
            strategy.calculate_weights(signals),
            window,
        );
        let capped: Vec<(String, f64)> = weights
            .into_iter()
            .map(|(symbol, weight)| (symbol, weight.min(config.max_position_size)))
            .filter(|(_, weight)| *weight > 0.0)
            .collect();
        let capped_weights: HashMap<String, f64> = capped.iter().cloned().collect();
        let selected = top_n_by_score(capped, config.max_positions, false);

        let total_value = portfolio.get_total_value(prices);
        let mut targets = BTreeMap::new();
        for symbol in selected {
            let (Some(&weight), Some(&price)) = (capped_weights.get(&symbol), prices.get(&symbol))
            else {
                continue;
            };
            let shares = (weight * total_value / price).floor();
            if shares.is_finite() && shares >= 1.0 {
                targets.insert(symbol, shares as u64);
            }
        }

        for signal in signals {
            if signal.action == SignalAction::Hold && !targets.contains_key(&signal.symbol) {
                let held = portfolio.shares_of(&signal.symbol);
                if held > 0 {
                    targets.insert(signal.symbol.clone(), held);
                }
            }
        }
        targets
    }

    /// Re-weights the bought symbols with the configured scheme, keeping the
    /// total exposure the signals asked for.
    fn apply_weighting(
        &self,
        method: WeightingMethod,
        weights: WeightMap,
        window: &PanelWindow<'_>,
    ) -> WeightMap {
        if method == WeightingMethod::Signal || weights.is_empty() {
            return weights;
        }
        let exposure: f64 = weights.values().sum();
        let symbols: Vec<String> = weights.keys().cloned().collect();
        let base = match method {
            WeightingMethod::EqualWeight => PortfolioOptimizer::equal_weight(&symbols),
            _ => match window.returns_matrix(Some(&symbols)) {
                Some(returns) if returns.n_assets() == symbols.len() => match method {
                    WeightingMethod::InverseVolatility => {
                        PortfolioOptimizer::inverse_volatility_weighted(&returns)
                    }
                    WeightingMethod::RiskParity => {
                        self.optimizer.risk_parity(&returns, RiskParityMethod::Optimized)
                    }
                    WeightingMethod::MinimumVariance => {
                        self.optimizer.minimum_variance_portfolio(&returns)
                    }
                    _ => self.optimizer.maximum_diversification_portfolio(&returns),
                },
                _ => {
                    debug!(
                        "Not enough aligned history on {} for {:?}; using equal weight",
                        window.as_of(),
                        method
                    );
                    PortfolioOptimizer::equal_weight(&symbols)
                }
            },
        };
        base.into_iter()
            .map(|(symbol, weight)| (symbol, weight * exposure))
            .collect()
    }

    fn build_result(
        &self,
        config: &StrategyConfig,
        panel: &PricePanel,
        outcome: LoopOutcome,
        started: Instant,
    ) -> BacktestResult {
        let LoopOutcome {
            portfolio,
            rebalance_count,
            skipped_rebalances,
        } = outcome;
        let summary = portfolio.summary();
        let (snapshots, trades) = portfolio.into_history();

        let values: DatedSeries = snapshots
            .iter()
            .map(|snapshot| (snapshot.date, snapshot.total_value))
            .collect();
        let returns = PerformanceCalculator::returns_from_values(&values);
        let mut performance_summary = self
            .calculator
            .calculate_comprehensive_metrics(&returns)
            .to_map();

        if let Some(symbol) = config.benchmark_symbol.as_deref() {
            let closes: DatedSeries = panel
                .close_series(symbol)
                .into_iter()
                .filter(|(date, _)| *date >= config.start_date && *date <= config.end_date)
                .collect();
            if closes.len() < 2 {
                warn!("Benchmark {} has fewer than two closes in range", symbol);
            }
            let benchmark_returns = PerformanceCalculator::returns_from_values(&closes);
            let comparison = self
                .calculator
                .calculate_benchmark_comparison(&returns, &benchmark_returns);
            performance_summary.extend(comparison.to_map("benchmark_"));
        }

        let final_value = values
            .last()
            .map(|(_, value)| *value)
            .unwrap_or(config.investment_amount);
        performance_summary.insert("final_value".to_string(), final_value);
        performance_summary.insert("total_trades".to_string(), summary.total_trades as f64);
        performance_summary.insert("buy_trades".to_string(), summary.buy_trades as f64);
        performance_summary.insert("sell_trades".to_string(), summary.sell_trades as f64);
        performance_summary.insert("total_commission".to_string(), summary.total_commission);
        performance_summary.insert("realized_pnl".to_string(), summary.realized_pnl);
        performance_summary.insert("rebalance_count".to_string(), rebalance_count as f64);
        performance_summary.insert("skipped_rebalances".to_string(), skipped_rebalances as f64);

        let first_date = values
            .first()
            .map(|(date, _)| *date)
            .unwrap_or(config.start_date);
        let last_date = values
            .last()
            .map(|(date, _)| *date)
            .unwrap_or(config.end_date);

        BacktestResult {
            id: Uuid::new_v4().to_string(),
            strategy_config: config.clone(),
            start_date: first_date,
            end_date: last_date,
            initial_capital: config.investment_amount,
            final_portfolio_value: final_value,
            portfolio_value_history: snapshots,
            trade_history: trades,
            performance_summary,
            execution_time: started.elapsed().as_secs_f64(),
        }
    }
}

/// Trading days in `[start, end]`, used by callers that want to size a run.
pub fn simulated_dates(panel: &PricePanel, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    panel
        .trading_dates()
        .iter()
        .copied()
        .filter(|date| *date >= start && *date <= end)
        .collect()
}
