use crate::commands::market_data_snapshot::{load_price_rows, write_json};
use crate::config::EngineRuntimeSettings;
use crate::models::{DatedSeries, WeightMap};
use crate::optimizer::{
    EfficientFrontier, OptimizerSettings, PortfolioOptimizer, RebalancingFrequencyAnalysis,
    RiskParityMethod,
};
use crate::panel::PricePanel;
use crate::returns::ReturnsMatrix;
use anyhow::{anyhow, Result};
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Serialize)]
struct FrontierReport {
    symbols: Vec<String>,
    periods: usize,
    frontier: EfficientFrontier,
    minimum_variance: WeightMap,
    maximum_diversification: WeightMap,
    risk_parity: WeightMap,
    kelly: WeightMap,
    /// Rebalancing interval study for the minimum-variance weights.
    rebalancing: RebalancingFrequencyAnalysis,
}

pub fn run(
    settings: EngineRuntimeSettings,
    data_path: &Path,
    points: usize,
    transaction_cost: f64,
    output: Option<&Path>,
) -> Result<()> {
    let panel = PricePanel::new(load_price_rows(data_path)?)?;
    let closes: BTreeMap<String, DatedSeries> = panel
        .symbols()
        .into_iter()
        .map(|symbol| {
            let series = panel.close_series(&symbol);
            (symbol, series)
        })
        .collect();
    let returns = ReturnsMatrix::from_prices(&closes)
        .ok_or_else(|| anyhow!("Need at least two common trading dates across all symbols"))?;
    info!(
        "Computing {} frontier points over {} symbols and {} return periods",
        points,
        returns.n_assets(),
        returns.n_periods()
    );

    let optimizer = PortfolioOptimizer::new(OptimizerSettings::from(&settings));
    let frontier = optimizer.efficient_frontier(&returns, points);
    if frontier.is_empty() {
        info!("Covariance is not positive definite; frontier is empty");
    }

    let minimum_variance = optimizer.minimum_variance_portfolio(&returns);
    let rebalancing =
        optimizer.optimize_rebalancing_frequency(&returns, &minimum_variance, transaction_cost);
    info!(
        "Best rebalancing interval for minimum variance at cost {}: {} days",
        transaction_cost, rebalancing.optimal_interval
    );

    let report = FrontierReport {
        symbols: returns.symbols().to_vec(),
        periods: returns.n_periods(),
        maximum_diversification: optimizer.maximum_diversification_portfolio(&returns),
        risk_parity: optimizer.risk_parity(&returns, RiskParityMethod::Optimized),
        kelly: optimizer.kelly_from_returns(&returns, 1.0),
        minimum_variance,
        rebalancing,
        frontier,
    };
    write_json(&report, output)
}
