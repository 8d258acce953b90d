use crate::models::{Signal, SignalAction};
use chrono::NaiveDate;
use std::cmp::Ordering;

/// Create a hold signal (default action when a strategy has no opinion)
pub fn hold_signal(symbol: &str, date: NaiveDate) -> Signal {
    Signal::new(symbol, date, SignalAction::Hold, 0.0)
}

/// Create a buy signal targeting `weight` of the portfolio
pub fn buy_signal(symbol: &str, date: NaiveDate, weight: f64) -> Signal {
    Signal::new(symbol, date, SignalAction::Buy, weight)
}

/// Create a sell signal (exit the whole position)
pub fn sell_signal(symbol: &str, date: NaiveDate) -> Signal {
    Signal::new(symbol, date, SignalAction::Sell, 0.0)
}

/// Equal-weight buy signals for every symbol given
pub fn equal_weight_buys(symbols: &[String], date: NaiveDate) -> Vec<Signal> {
    if symbols.is_empty() {
        return Vec::new();
    }
    let weight = 1.0 / symbols.len() as f64;
    symbols
        .iter()
        .map(|symbol| buy_signal(symbol, date, weight))
        .collect()
}

/// Symbols of the `n` highest (or lowest, when `ascending`) finite scores.
/// Ties are broken by symbol so the selection is deterministic.
pub fn top_n_by_score(mut scores: Vec<(String, f64)>, n: usize, ascending: bool) -> Vec<String> {
    scores.retain(|(_, score)| score.is_finite());
    scores.sort_by(|a, b| {
        let by_score = if ascending {
            a.1.partial_cmp(&b.1)
        } else {
            b.1.partial_cmp(&a.1)
        };
        by_score.unwrap_or(Ordering::Equal).then_with(|| a.0.cmp(&b.0))
    });
    scores.into_iter().take(n).map(|(symbol, _)| symbol).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_scores_in_both_directions() {
        let scores = vec![
            ("A".to_string(), 0.3),
            ("B".to_string(), f64::NAN),
            ("C".to_string(), 0.9),
            ("D".to_string(), 0.3),
        ];
        assert_eq!(top_n_by_score(scores.clone(), 2, false), vec!["C", "A"]);
        assert_eq!(top_n_by_score(scores, 2, true), vec!["A", "D"]);
    }
}
