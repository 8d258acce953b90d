use crate::config::StrategyConfig;
use crate::error::EngineError;
use crate::models::{Signal, SignalAction, WeightMap};
use crate::optimizer::OptimizerSettings;
use crate::panel::PanelWindow;
use std::collections::{BTreeMap, HashMap};

/// Signal source consulted by the engine on rebalance dates.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Signals for the window's `as_of` date. The window never contains rows
    /// dated after `as_of`.
    fn generate_signals(&self, window: &PanelWindow<'_>) -> Vec<Signal>;

    /// Target weights implied by `signals`: buy weights, scaled down to sum to
    /// one when they exceed it.
    fn calculate_weights(&self, signals: &[Signal]) -> WeightMap {
        let mut weights = WeightMap::new();
        for signal in signals {
            if signal.action == SignalAction::Buy && signal.weight > 0.0 {
                *weights.entry(signal.symbol.clone()).or_insert(0.0) += signal.weight;
            }
        }
        let total: f64 = weights.values().sum();
        if total > 1.0 {
            for weight in weights.values_mut() {
                *weight /= total;
            }
        }
        weights
    }
}

#[path = "strategies/buy_and_hold.rs"]
pub mod buy_and_hold;

pub use buy_and_hold::BuyAndHoldStrategy;

#[path = "strategies/momentum.rs"]
pub mod momentum;

pub use momentum::MomentumStrategy;

#[path = "strategies/low_per.rs"]
pub mod low_per;

pub use low_per::LowPerStrategy;

#[path = "strategies/risk_parity.rs"]
pub mod risk_parity;

pub use risk_parity::RiskParityStrategy;

/// Weighted union of named sub-strategies.
pub struct CombinedStrategy {
    members: Vec<(Box<dyn Strategy>, f64)>,
}

#[derive(Default)]
struct Contribution {
    weight: f64,
    votes: usize,
    sells: usize,
}

impl CombinedStrategy {
    /// Allocation weights are normalized to sum to one; non-positive ones are dropped.
    pub fn new(members: Vec<(Box<dyn Strategy>, f64)>) -> Self {
        let members: Vec<_> = members
            .into_iter()
            .filter(|(_, weight)| weight.is_finite() && *weight > 0.0)
            .collect();
        let total: f64 = members.iter().map(|(_, weight)| weight).sum();
        let members = members
            .into_iter()
            .map(|(strategy, weight)| (strategy, weight / total))
            .collect();
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn allocations(&self) -> Vec<(&str, f64)> {
        self.members
            .iter()
            .map(|(strategy, weight)| (strategy.name(), *weight))
            .collect()
    }
}

impl Strategy for CombinedStrategy {
    fn name(&self) -> &str {
        "combined"
    }

    /// A symbol is bought when its allocation-weighted buy weight is positive,
    /// sold only when every contributing strategy says sell, and held otherwise.
    fn generate_signals(&self, window: &PanelWindow<'_>) -> Vec<Signal> {
        let mut contributions: BTreeMap<String, Contribution> = BTreeMap::new();
        for (strategy, allocation) in &self.members {
            for signal in strategy.generate_signals(window) {
                let entry = contributions.entry(signal.symbol.clone()).or_default();
                entry.votes += 1;
                match signal.action {
                    SignalAction::Buy => entry.weight += allocation * signal.weight,
                    SignalAction::Sell => entry.sells += 1,
                    SignalAction::Hold => {}
                }
            }
        }

        contributions
            .into_iter()
            .map(|(symbol, contribution)| {
                let action = if contribution.weight > 0.0 {
                    SignalAction::Buy
                } else if contribution.sells == contribution.votes {
                    SignalAction::Sell
                } else {
                    SignalAction::Hold
                };
                Signal::new(symbol, window.as_of(), action, contribution.weight.min(1.0))
            })
            .collect()
    }
}

/// Builds a strategy from its parameter map. Strategies that solve for
/// weights take the engine's optimizer settings.
pub type StrategyConstructor = fn(HashMap<String, f64>, &OptimizerSettings) -> Box<dyn Strategy>;

/// Name to constructor table, resolved once per run.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    constructors: BTreeMap<String, StrategyConstructor>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("buy_and_hold", |p, _| Box::new(BuyAndHoldStrategy::new(p)));
        registry.register("momentum", |p, _| Box::new(MomentumStrategy::new(p)));
        registry.register("low_per", |p, _| Box::new(LowPerStrategy::new(p)));
        registry.register("risk_parity", |p, settings| {
            Box::new(RiskParityStrategy::new(p, settings))
        });
        registry
    }

    pub fn register(&mut self, name: &str, constructor: StrategyConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn create(
        &self,
        name: &str,
        parameters: HashMap<String, f64>,
        settings: &OptimizerSettings,
    ) -> Result<Box<dyn Strategy>, EngineError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| EngineError::UnknownStrategy(name.to_string()))?;
        Ok(constructor(parameters, settings))
    }

    /// Builds the weighted union described by `config.strategies`.
    pub fn build_combined(
        &self,
        config: &StrategyConfig,
        settings: &OptimizerSettings,
    ) -> Result<CombinedStrategy, EngineError> {
        let mut members = Vec::with_capacity(config.strategies.len());
        for allocation in &config.strategies {
            let parameters = config.parameters_for(&allocation.name);
            let strategy = self.create(&allocation.name, parameters, settings)?;
            members.push((strategy, allocation.weight));
        }
        let combined = CombinedStrategy::new(members);
        if combined.is_empty() {
            return Err(EngineError::InvalidConfig(
                "no strategy has a positive weight".to_string(),
            ));
        }
        Ok(combined)
    }
}
