use crate::config::StrategyConfig;
use anyhow::anyhow;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Symbol -> weight mapping. Ordered so that reports and tests are deterministic.
pub type WeightMap = BTreeMap<String, f64>;

/// A `(date, value)` series ordered by date.
pub type DatedSeries = Vec<(NaiveDate, f64)>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

/// Trading intent emitted by a strategy. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub symbol: String,
    pub timestamp: NaiveDate,
    pub action: SignalAction,
    /// Target portfolio weight in [0, 1].
    pub weight: f64,
}

impl Signal {
    pub fn new(symbol: impl Into<String>, timestamp: NaiveDate, action: SignalAction, weight: f64) -> Self {
        let weight = if weight.is_finite() {
            weight.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            symbol: symbol.into(),
            timestamp,
            action,
            weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub shares: u64,
    pub avg_cost: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub weight: f64,
}

impl Position {
    pub(crate) fn opened(symbol: &str, shares: u64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            shares,
            avg_cost: price,
            current_price: price,
            market_value: shares as f64 * price,
            unrealized_pnl: 0.0,
            weight: 0.0,
        }
    }

    pub(crate) fn mark(&mut self, price: f64, total_value: f64) {
        self.current_price = price;
        self.market_value = self.shares as f64 * price;
        self.unrealized_pnl = (price - self.avg_cost) * self.shares as f64;
        self.weight = if total_value > 0.0 {
            self.market_value / total_value
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }
}

/// Executed fill. Append-only; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub date: NaiveDate,
    pub symbol: String,
    pub action: TradeAction,
    pub shares: u64,
    pub price: f64,
    pub total_value: f64,
    pub commission: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortfolioSnapshot {
    pub date: NaiveDate,
    pub total_value: f64,
    pub cash: f64,
    pub positions: Vec<Position>,
    pub position_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: String,
    pub strategy_config: StrategyConfig,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub final_portfolio_value: f64,
    pub portfolio_value_history: Vec<PortfolioSnapshot>,
    pub trade_history: Vec<Trade>,
    /// Non-finite metrics (an unbounded Sortino or profit factor) are written
    /// as the strings `"inf"`, `"-inf"` or `"nan"` since JSON has no literal for them.
    #[serde(
        serialize_with = "serialize_metric_map",
        deserialize_with = "deserialize_metric_map"
    )]
    pub performance_summary: BTreeMap<String, f64>,
    /// Wall-clock seconds spent inside `run_backtest`.
    pub execution_time: f64,
}

impl BacktestResult {
    pub fn value_series(&self) -> DatedSeries {
        self.portfolio_value_history
            .iter()
            .map(|snapshot| (snapshot.date, snapshot.total_value))
            .collect()
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.performance_summary.get(key).copied()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MetricValue {
    Number(f64),
    Label(String),
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            MetricValue::Number(value)
        } else if value.is_nan() {
            MetricValue::Label("nan".to_string())
        } else if value > 0.0 {
            MetricValue::Label("inf".to_string())
        } else {
            MetricValue::Label("-inf".to_string())
        }
    }
}

impl MetricValue {
    fn into_f64(self) -> Result<f64, String> {
        match self {
            MetricValue::Number(value) => Ok(value),
            MetricValue::Label(label) => match label.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(format!("Unknown metric value '{}'", other)),
            },
        }
    }
}

fn serialize_metric_map<S>(metrics: &BTreeMap<String, f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let encoded: BTreeMap<&str, MetricValue> = metrics
        .iter()
        .map(|(key, value)| (key.as_str(), MetricValue::from(*value)))
        .collect();
    encoded.serialize(serializer)
}

fn deserialize_metric_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, MetricValue>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            value
                .into_f64()
                .map(|number| (key, number))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}
