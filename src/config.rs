use crate::calendar::RebalancingFrequency;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One named sub-strategy and its share of the combined signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyAllocation {
    pub name: String,
    pub weight: f64,
}

/// How rebalance target weights are derived from the combined signals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    /// Use the combined signal weights as emitted.
    #[default]
    Signal,
    EqualWeight,
    InverseVolatility,
    RiskParity,
    MinimumVariance,
    MaximumDiversification,
}

fn default_max_positions() -> usize {
    20
}

fn default_max_position_size() -> f64 {
    0.2
}

fn default_transaction_cost() -> f64 {
    0.00015
}

/// Run configuration for a single backtest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyConfig {
    pub investment_amount: f64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub rebalancing_freq: RebalancingFrequency,
    /// Commission as a fraction of traded notional.
    #[serde(default = "default_transaction_cost")]
    pub transaction_cost: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default)]
    pub min_position_size: f64,
    pub strategies: Vec<StrategyAllocation>,
    #[serde(default)]
    pub parameters: HashMap<String, HashMap<String, f64>>,
    #[serde(default)]
    pub weighting_method: WeightingMethod,
    #[serde(default)]
    pub benchmark_symbol: Option<String>,
}

impl StrategyConfig {
    pub fn new(
        investment_amount: f64,
        start_date: NaiveDate,
        end_date: NaiveDate,
        strategies: Vec<StrategyAllocation>,
    ) -> Self {
        Self {
            investment_amount,
            start_date,
            end_date,
            rebalancing_freq: RebalancingFrequency::default(),
            transaction_cost: default_transaction_cost(),
            max_positions: default_max_positions(),
            max_position_size: default_max_position_size(),
            min_position_size: 0.0,
            strategies,
            parameters: HashMap::new(),
            weighting_method: WeightingMethod::default(),
            benchmark_symbol: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|error| anyhow!("Invalid config JSON: {}", error))?;
        config.validate()?;
        Ok(config)
    }

    pub fn parameters_for(&self, strategy_name: &str) -> HashMap<String, f64> {
        self.parameters
            .get(strategy_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.investment_amount.is_finite() || self.investment_amount <= 0.0 {
            return Err(anyhow!(
                "investment_amount must be a positive number (value: {})",
                self.investment_amount
            ));
        }
        if self.end_date < self.start_date {
            return Err(anyhow!(
                "end_date ({}) must be >= start_date ({})",
                self.end_date,
                self.start_date
            ));
        }
        if !self.transaction_cost.is_finite()
            || self.transaction_cost < 0.0
            || self.transaction_cost >= 1.0
        {
            return Err(anyhow!(
                "transaction_cost must be in [0, 1) (value: {})",
                self.transaction_cost
            ));
        }
        if self.max_positions == 0 {
            return Err(anyhow!("max_positions must be >= 1"));
        }
        if !self.max_position_size.is_finite()
            || self.max_position_size <= 0.0
            || self.max_position_size > 1.0
        {
            return Err(anyhow!(
                "max_position_size must be in (0, 1] (value: {})",
                self.max_position_size
            ));
        }
        if !self.min_position_size.is_finite()
            || self.min_position_size < 0.0
            || self.min_position_size > self.max_position_size
        {
            return Err(anyhow!(
                "min_position_size must be in [0, max_position_size] (value: {})",
                self.min_position_size
            ));
        }
        if self.strategies.is_empty() {
            return Err(anyhow!("strategies must name at least one strategy"));
        }
        for allocation in &self.strategies {
            if allocation.name.trim().is_empty() {
                return Err(anyhow!("strategy names must not be empty"));
            }
            if !allocation.weight.is_finite() || allocation.weight <= 0.0 {
                return Err(anyhow!(
                    "strategy {} weight must be positive (value: {})",
                    allocation.name,
                    allocation.weight
                ));
            }
        }
        Ok(())
    }
}

const DEFAULT_RISK_FREE_RATE: f64 = 0.02;
const DEFAULT_LOOKBACK_CALENDAR_DAYS: usize = 90;
const MIN_LOOKBACK_CALENDAR_DAYS: usize = 60;
const DEFAULT_MIN_LOOKBACK_ROWS: usize = 30;
const DEFAULT_SOLVER_TIMEOUT_MS: usize = 5_000;
const DEFAULT_SOLVER_MAX_ITERATIONS: usize = 5_000;

/// Engine-wide knobs that are not part of a strategy configuration.
#[derive(Debug, Clone)]
pub struct EngineRuntimeSettings {
    pub risk_free_rate: f64,
    pub lookback_calendar_days: usize,
    pub min_lookback_rows: usize,
    pub solver_timeout: Duration,
    pub solver_max_iterations: usize,
}

impl Default for EngineRuntimeSettings {
    fn default() -> Self {
        Self {
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
            lookback_calendar_days: DEFAULT_LOOKBACK_CALENDAR_DAYS,
            min_lookback_rows: DEFAULT_MIN_LOOKBACK_ROWS,
            solver_timeout: Duration::from_millis(DEFAULT_SOLVER_TIMEOUT_MS as u64),
            solver_max_iterations: DEFAULT_SOLVER_MAX_ITERATIONS,
        }
    }
}

impl EngineRuntimeSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let risk_free_rate = optional_setting_f64(
            settings,
            "RISK_FREE_RATE",
            DEFAULT_RISK_FREE_RATE,
            Some(-1.0),
            Some(1.0),
        )?;
        let lookback_calendar_days = optional_setting_usize(
            settings,
            "LOOKBACK_CALENDAR_DAYS",
            DEFAULT_LOOKBACK_CALENDAR_DAYS,
            MIN_LOOKBACK_CALENDAR_DAYS,
        )?;
        let min_lookback_rows =
            optional_setting_usize(settings, "MIN_LOOKBACK_ROWS", DEFAULT_MIN_LOOKBACK_ROWS, 1)?;
        let solver_timeout_ms =
            optional_setting_usize(settings, "SOLVER_TIMEOUT_MS", DEFAULT_SOLVER_TIMEOUT_MS, 1)?;
        let solver_max_iterations = optional_setting_usize(
            settings,
            "SOLVER_MAX_ITERATIONS",
            DEFAULT_SOLVER_MAX_ITERATIONS,
            10,
        )?;

        Ok(Self {
            risk_free_rate,
            lookback_calendar_days,
            min_lookback_rows,
            solver_timeout: Duration::from_millis(solver_timeout_ms as u64),
            solver_max_iterations,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}
