use crate::commands::market_data_snapshot::{load_price_rows, write_json};
use crate::config::{EngineRuntimeSettings, StrategyConfig};
use crate::engine::BacktestEngine;
use crate::panel::InMemoryDataProvider;
use crate::strategy::StrategyRegistry;
use anyhow::{anyhow, Result};
use log::info;
use std::fs;
use std::path::Path;

pub fn run(
    settings: EngineRuntimeSettings,
    config_path: &Path,
    data_path: &Path,
    output: Option<&Path>,
) -> Result<()> {
    info!("Loading strategy config from {}", config_path.display());
    let raw = fs::read_to_string(config_path)
        .map_err(|error| anyhow!("Failed to read {}: {}", config_path.display(), error))?;
    let config = StrategyConfig::from_json(&raw)?;

    let rows = load_price_rows(data_path)?;
    info!("Loaded {} price rows from {}", rows.len(), data_path.display());
    let provider = InMemoryDataProvider::from_rows(rows)?;

    let registry = StrategyRegistry::with_builtin();
    for allocation in &config.strategies {
        if !registry.contains(&allocation.name) {
            return Err(anyhow!(
                "Unknown strategy '{}'. Available: {}",
                allocation.name,
                registry.names().join(", ")
            ));
        }
    }

    let mut engine = BacktestEngine::new(&provider, &registry, settings);
    let result = engine
        .run_backtest(&config)
        .ok_or_else(|| anyhow!("Backtest did not produce a result (state: {})", engine.state()))?;

    for key in ["total_return", "annual_return", "sharpe_ratio", "max_drawdown"] {
        if let Some(value) = result.metric(key) {
            info!("{:>14}: {:.4}", key, value);
        }
    }
    write_json(&result, output)?;
    if let Some(path) = output {
        info!("Backtest result {} written to {}", result.id, path.display());
    }
    Ok(())
}
