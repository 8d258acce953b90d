use crate::models::Signal;
use crate::panel::PanelWindow;
use crate::param_utils::{get_param_f64, get_usize_param_min};
use crate::strategy_utils::{buy_signal, hold_signal, sell_signal, top_n_by_score};
use std::collections::HashMap;

pub const PER_FIELD: &str = "per";

/// Value screen: equal-weight the `topN` symbols with the lowest positive
/// price/earnings ratio on the latest bar.
pub struct LowPerStrategy {
    name: String,
    top_n: usize,
    max_per: f64,
}

impl LowPerStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        Self {
            name: "low_per".to_string(),
            top_n: get_usize_param_min(&parameters, "topN", 10, 1),
            max_per: get_param_f64(&parameters, "maxPer", f64::INFINITY),
        }
    }
}

impl super::Strategy for LowPerStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_signals(&self, window: &PanelWindow<'_>) -> Vec<Signal> {
        let as_of = window.as_of();
        let mut candidates = Vec::new();
        let mut excluded = Vec::new();
        let mut unrated = Vec::new();
        for (symbol, bar) in window.latest_bars() {
            // Symbols without the field keep whatever is held.
            let Some(per) = bar.fundamental(PER_FIELD) else {
                unrated.push(hold_signal(symbol, as_of));
                continue;
            };
            if per > 0.0 && per <= self.max_per && bar.close > 0.0 {
                candidates.push((symbol.to_string(), per));
            } else {
                excluded.push(symbol.to_string());
            }
        }

        let selected = top_n_by_score(candidates.clone(), self.top_n, true);
        if selected.is_empty() {
            let mut signals: Vec<Signal> = excluded.iter().map(|s| sell_signal(s, as_of)).collect();
            signals.extend(unrated);
            return signals;
        }
        let weight = 1.0 / selected.len() as f64;

        let mut signals: Vec<Signal> = selected
            .iter()
            .map(|symbol| buy_signal(symbol, as_of, weight))
            .collect();
        signals.extend(
            candidates
                .iter()
                .map(|(symbol, _)| symbol)
                .chain(excluded.iter())
                .filter(|symbol| !selected.contains(symbol))
                .map(|symbol| sell_signal(symbol, as_of)),
        );
        signals.extend(unrated);
        signals
    }
}
