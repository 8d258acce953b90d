use crate::models::Signal;
use crate::panel::PanelWindow;
use crate::strategy_utils::equal_weight_buys;
use std::collections::HashMap;

pub struct BuyAndHoldStrategy {
    name: String,
}

impl BuyAndHoldStrategy {
    pub fn new(_parameters: HashMap<String, f64>) -> Self {
        Self {
            name: "buy_and_hold".to_string(),
        }
    }
}

impl super::Strategy for BuyAndHoldStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_signals(&self, window: &PanelWindow<'_>) -> Vec<Signal> {
        // Do not turn this into HOLD once positions exist; the engine keeps
        // shares unchanged when the target equals the current holding.
        let symbols: Vec<String> = window
            .latest_bars()
            .into_iter()
            .filter(|(_, bar)| bar.close > 0.0)
            .map(|(symbol, _)| symbol.to_string())
            .collect();
        equal_weight_buys(&symbols, window.as_of())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalAction;
    use crate::panel::{PriceBar, PricePanel};
    use crate::strategy::Strategy;
    use chrono::NaiveDate;

    #[test]
    fn buys_every_priced_symbol_equally() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let panel = PricePanel::new(vec![
            PriceBar::flat(date, "AAA", 10.0),
            PriceBar::flat(date, "BBB", 20.0),
        ])
        .unwrap();
        let strategy = BuyAndHoldStrategy::new(HashMap::new());
        let signals = strategy.generate_signals(&panel.window(date, 30));
        assert_eq!(signals.len(), 2);
        assert!(signals
            .iter()
            .all(|s| s.action == SignalAction::Buy && (s.weight - 0.5).abs() < 1e-12));
    }
}
