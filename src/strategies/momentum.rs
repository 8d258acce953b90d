use crate::indicators::{annualized_volatility, calculate_sma, trailing_return};
use crate::models::Signal;
use crate::panel::PanelWindow;
use crate::param_utils::{
    get_param_f64, get_param_f64_clamped, get_param_flag, get_usize_param_min,
};
use crate::strategy_utils::{buy_signal, hold_signal, sell_signal, top_n_by_score};
use std::collections::HashMap;

/// Cross-sectional momentum: hold the `topN` symbols with the strongest
/// trailing return, optionally only while they trade above their SMA.
pub struct MomentumStrategy {
    name: String,
    lookback: usize,
    top_n: usize,
    sma_period: usize,
    use_trend_filter: bool,
    min_return: f64,
    max_volatility: f64,
}

impl MomentumStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        Self {
            name: "momentum".to_string(),
            lookback: get_usize_param_min(&parameters, "lookback", 40, 1),
            top_n: get_usize_param_min(&parameters, "topN", 5, 1),
            sma_period: get_usize_param_min(&parameters, "smaPeriod", 20, 1),
            use_trend_filter: get_param_flag(&parameters, "useTrendFilter", true),
            min_return: get_param_f64_clamped(&parameters, "minReturn", 0.0, -1.0, 10.0),
            max_volatility: get_param_f64(&parameters, "maxVolatility", f64::INFINITY),
        }
    }

    fn score(&self, closes: &[f64]) -> Option<f64> {
        let momentum = trailing_return(closes, self.lookback)?;
        if momentum <= self.min_return {
            return None;
        }
        if self.max_volatility.is_finite()
            && annualized_volatility(closes, self.lookback) > self.max_volatility
        {
            return None;
        }
        if self.use_trend_filter {
            let sma = calculate_sma(closes, self.sma_period);
            let last = *closes.last()?;
            if last < *sma.last()? {
                return None;
            }
        }
        Some(momentum)
    }
}

impl super::Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_signals(&self, window: &PanelWindow<'_>) -> Vec<Signal> {
        let as_of = window.as_of();
        let mut scored = Vec::new();
        let mut rejected = Vec::new();
        let mut undecided = Vec::new();
        for (symbol, series) in window.closes_by_symbol() {
            let closes: Vec<f64> = series.iter().map(|(_, close)| *close).collect();
            if closes.len() <= self.lookback {
                // Not enough history to judge; keep whatever is held.
                undecided.push(symbol);
                continue;
            }
            match self.score(&closes) {
                Some(score) => scored.push((symbol, score)),
                None => rejected.push(symbol),
            }
        }

        let selected = top_n_by_score(scored.clone(), self.top_n, false);
        let weight = if selected.is_empty() {
            0.0
        } else {
            1.0 / selected.len() as f64
        };

        let mut signals: Vec<Signal> = selected
            .iter()
            .map(|symbol| buy_signal(symbol, as_of, weight))
            .collect();
        signals.extend(
            scored
                .iter()
                .filter(|(symbol, _)| !selected.contains(symbol))
                .map(|(symbol, _)| sell_signal(symbol, as_of)),
        );
        signals.extend(rejected.iter().map(|symbol| sell_signal(symbol, as_of)));
        signals.extend(undecided.iter().map(|symbol| hold_signal(symbol, as_of)));
        signals
    }
}
