use crate::models::Signal;
use crate::optimizer::{OptimizerSettings, PortfolioOptimizer, RiskParityMethod};
use crate::panel::PanelWindow;
use crate::param_utils::{get_param_f64, get_param_flag};
use crate::strategy_utils::buy_signal;
use log::debug;
use std::collections::HashMap;

/// Allocates across every symbol in the window so that each contributes
/// roughly the same share of portfolio risk.
pub struct RiskParityStrategy {
    name: String,
    method: RiskParityMethod,
    optimizer: PortfolioOptimizer,
}

impl RiskParityStrategy {
    /// `settings` carries the engine's solver budget; `riskFreeRate` overrides
    /// its rate.
    pub fn new(parameters: HashMap<String, f64>, settings: &OptimizerSettings) -> Self {
        let method = if get_param_flag(&parameters, "naive", false) {
            RiskParityMethod::Naive
        } else {
            RiskParityMethod::Optimized
        };
        let settings = OptimizerSettings {
            risk_free_rate: get_param_f64(&parameters, "riskFreeRate", settings.risk_free_rate),
            ..settings.clone()
        };
        Self {
            name: "risk_parity".to_string(),
            method,
            optimizer: PortfolioOptimizer::new(settings),
        }
    }
}

impl super::Strategy for RiskParityStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_signals(&self, window: &PanelWindow<'_>) -> Vec<Signal> {
        let Some(returns) = window.returns_matrix(None) else {
            debug!(
                "risk_parity: not enough aligned history on {}",
                window.as_of()
            );
            return Vec::new();
        };
        self.optimizer
            .risk_parity(&returns, self.method)
            .into_iter()
            .filter(|(_, weight)| *weight > 0.0)
            .map(|(symbol, weight)| buy_signal(&symbol, window.as_of(), weight))
            .collect()
    }
}
