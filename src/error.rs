use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Failures that abort a backtest before the simulation loop starts.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no price data between {start} and {end}")]
    EmptyPanel { start: NaiveDate, end: NaiveDate },
    #[error("duplicate panel row for {symbol} on {date}")]
    DuplicateRow { date: NaiveDate, symbol: String },
    #[error("invalid panel row for {symbol} on {date}: {reason}")]
    InvalidRow {
        date: NaiveDate,
        symbol: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),
}

/// Numerical solver failures. Optimizer entry points translate every variant
/// into their fallback weighting.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolverError {
    #[error("covariance matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("matrix is singular")]
    Singular,
    #[error("solver did not converge after {iterations} iterations")]
    DidNotConverge { iterations: usize },
    #[error("constraints are infeasible: {0}")]
    Infeasible(String),
    #[error("solver timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid solver input: {0}")]
    InvalidInput(String),
}

/// Why an order was resized away to nothing or skipped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradeRejection {
    #[error("price {0} is not a positive finite number")]
    InvalidPrice(f64),
    #[error("requested quantity is zero")]
    ZeroQuantity,
    #[error("cash {available:.2} cannot cover a single share at {unit_cost:.2}")]
    InsufficientCash { available: f64, unit_cost: f64 },
    #[error("no open position in {0}")]
    NoPosition(String),
}

/// Advisory constraint checks. These never block trading.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConstraintWarning {
    #[error("holding {count} positions exceeds the limit of {limit}")]
    TooManyPositions { count: usize, limit: usize },
    #[error("{symbol} weight {weight:.4} exceeds the maximum {limit:.4}")]
    PositionTooLarge {
        symbol: String,
        weight: f64,
        limit: f64,
    },
    #[error("{symbol} weight {weight:.4} is below the minimum {limit:.4}")]
    PositionTooSmall {
        symbol: String,
        weight: f64,
        limit: f64,
    },
}
