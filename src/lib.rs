pub mod calendar;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod models;
pub mod optimizer;
pub mod panel;
pub mod param_utils;
pub mod performance;
pub mod portfolio;
pub mod returns;
pub mod solver;
pub mod strategy;
pub mod strategy_utils;

pub use config::{EngineRuntimeSettings, StrategyAllocation, StrategyConfig, WeightingMethod};
pub use engine::{BacktestEngine, EngineState};
pub use error::{ConstraintWarning, EngineError, SolverError, TradeRejection};
pub use models::{BacktestResult, PortfolioSnapshot, Position, Signal, SignalAction, Trade};
pub use optimizer::PortfolioOptimizer;
pub use panel::{DataProvider, InMemoryDataProvider, PriceBar, PricePanel};
pub use performance::{PerformanceCalculator, PerformanceMetrics};
pub use portfolio::Portfolio;
pub use strategy::{Strategy, StrategyRegistry};
