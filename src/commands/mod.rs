pub mod backtest;
pub mod frontier;
pub mod market_data_snapshot;
