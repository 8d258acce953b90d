use crate::returns::TRADING_DAYS_PER_YEAR;
use statrs::statistics::Statistics;

/// Simple moving average, padded with the first price until the window fills.
pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period <= 1 {
        return prices.to_vec();
    }
    if prices.len() < period {
        return vec![prices[0]; prices.len()];
    }

    let mut sma_values = Vec::with_capacity(prices.len());
    for _ in 0..period - 1 {
        sma_values.push(prices[0]);
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values.push(window_sum / period as f64);
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values.push(window_sum / period as f64);
    }

    sma_values
}

/// Return over the last `period` observations, or `None` without enough history.
pub fn trailing_return(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }
    let last = *closes.last()?;
    let base = closes[closes.len() - 1 - period];
    if base <= 0.0 {
        return None;
    }
    Some(last / base - 1.0)
}

/// Annualized close-to-close volatility over the trailing `lookback` returns.
pub fn annualized_volatility(closes: &[f64], lookback: usize) -> f64 {
    if closes.len() < 3 || lookback < 2 {
        return 0.0;
    }
    let start = closes.len().saturating_sub(lookback + 1);
    let returns: Vec<f64> = closes[start..]
        .windows(2)
        .filter(|pair| pair[0] > 0.0)
        .map(|pair| pair[1] / pair[0] - 1.0)
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }

    let deviation = returns.iter().std_dev();
    if !deviation.is_finite() {
        return 0.0;
    }
    deviation * TRADING_DAYS_PER_YEAR.sqrt()
}
