use crate::calendar::{period_key, ResamplePeriod};
use crate::models::DatedSeries;
use crate::returns::TRADING_DAYS_PER_YEAR;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::cmp::Ordering;
use std::collections::BTreeMap;

const ZERO_VOLATILITY: f64 = 1e-12;

/// Resampled statistics over compounded month or year returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodStats {
    pub mean: f64,
    pub std: f64,
    pub hit_rate: f64,
    pub best: f64,
    pub worst: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annual_return: f64,
    pub annual_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    /// Largest peak-to-trough decline as a non-positive fraction.
    pub max_drawdown: f64,
    /// Longest run of consecutive periods spent below a prior peak.
    pub max_drawdown_duration: usize,
    pub var_95: f64,
    pub cvar_95: f64,
    pub win_rate: f64,
    pub max_consecutive_losses: usize,
    pub profit_factor: f64,
    pub monthly: PeriodStats,
    pub yearly: PeriodStats,
}

impl PerformanceMetrics {
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("total_return".to_string(), self.total_return);
        map.insert("annual_return".to_string(), self.annual_return);
        map.insert("annual_volatility".to_string(), self.annual_volatility);
        map.insert("sharpe_ratio".to_string(), self.sharpe_ratio);
        map.insert("sortino_ratio".to_string(), self.sortino_ratio);
        map.insert("calmar_ratio".to_string(), self.calmar_ratio);
        map.insert("max_drawdown".to_string(), self.max_drawdown);
        map.insert(
            "max_drawdown_duration".to_string(),
            self.max_drawdown_duration as f64,
        );
        map.insert("var_95".to_string(), self.var_95);
        map.insert("cvar_95".to_string(), self.cvar_95);
        map.insert("win_rate".to_string(), self.win_rate);
        map.insert(
            "max_consecutive_losses".to_string(),
            self.max_consecutive_losses as f64,
        );
        map.insert("profit_factor".to_string(), self.profit_factor);
        insert_period_stats(&mut map, "monthly", &self.monthly);
        insert_period_stats(&mut map, "yearly", &self.yearly);
        map
    }
}

fn insert_period_stats(map: &mut BTreeMap<String, f64>, prefix: &str, stats: &PeriodStats) {
    map.insert(format!("{}_mean_return", prefix), stats.mean);
    map.insert(format!("{}_volatility", prefix), stats.std);
    map.insert(format!("{}_hit_rate", prefix), stats.hit_rate);
    map.insert(format!("{}_best", prefix), stats.best);
    map.insert(format!("{}_worst", prefix), stats.worst);
    map.insert(format!("{}_periods", prefix), stats.count as f64);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    pub excess_return: f64,
    pub beta: f64,
    pub alpha: f64,
    pub tracking_error: f64,
    pub information_ratio: f64,
    pub correlation: f64,
    pub common_periods: usize,
}

impl BenchmarkComparison {
    pub fn to_map(&self, prefix: &str) -> BTreeMap<String, f64> {
        [
            ("excess_return", self.excess_return),
            ("beta", self.beta),
            ("alpha", self.alpha),
            ("tracking_error", self.tracking_error),
            ("information_ratio", self.information_ratio),
            ("correlation", self.correlation),
            ("common_periods", self.common_periods as f64),
        ]
        .into_iter()
        .map(|(key, value)| (format!("{}{}", prefix, key), value))
        .collect()
    }
}

pub struct PerformanceCalculator {
    risk_free_rate: f64,
}

impl PerformanceCalculator {
    pub fn new(risk_free_rate: f64) -> Self {
        Self { risk_free_rate }
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate
    }

    /// Period-over-period percentage change of a value series, dated at the later point.
    pub fn returns_from_values(values: &[(NaiveDate, f64)]) -> DatedSeries {
        values
            .windows(2)
            .map(|pair| {
                let (_, previous) = pair[0];
                let (date, current) = pair[1];
                let change = if previous > 0.0 {
                    current / previous - 1.0
                } else {
                    0.0
                };
                (date, change)
            })
            .collect()
    }

    pub fn calculate_comprehensive_metrics(&self, returns: &[(NaiveDate, f64)]) -> PerformanceMetrics {
        let values: Vec<f64> = returns.iter().map(|(_, r)| *r).collect();
        if values.is_empty() {
            return PerformanceMetrics::default();
        }

        let total_return = total_return(&values);
        let annual_return = annualized_return(&values);
        let (max_drawdown, max_drawdown_duration) = max_drawdown(&values);
        let calmar_ratio = if max_drawdown < 0.0 {
            annual_return / max_drawdown.abs()
        } else {
            0.0
        };
        let (var_95, cvar_95) = value_at_risk(&values, 0.05);
        let wins = values.iter().filter(|r| **r > 0.0).count();

        PerformanceMetrics {
            total_return,
            annual_return,
            annual_volatility: annualized_volatility(&values),
            sharpe_ratio: sharpe_ratio(&values, self.risk_free_rate),
            sortino_ratio: sortino_ratio(&values, self.risk_free_rate),
            calmar_ratio,
            max_drawdown,
            max_drawdown_duration,
            var_95,
            cvar_95,
            win_rate: wins as f64 / values.len() as f64,
            max_consecutive_losses: longest_run(&values, |r| r < 0.0),
            profit_factor: profit_factor(&values),
            monthly: period_stats(returns, ResamplePeriod::Month),
            yearly: period_stats(returns, ResamplePeriod::Year),
        }
    }

    /// Compares two return series over the dates both contain.
    pub fn calculate_benchmark_comparison(
        &self,
        portfolio_returns: &[(NaiveDate, f64)],
        benchmark_returns: &[(NaiveDate, f64)],
    ) -> BenchmarkComparison {
        let benchmark: BTreeMap<NaiveDate, f64> = benchmark_returns.iter().copied().collect();
        let (ours, theirs): (Vec<f64>, Vec<f64>) = portfolio_returns
            .iter()
            .filter_map(|(date, r)| benchmark.get(date).map(|b| (*r, *b)))
            .unzip();

        let common_periods = ours.len();
        if common_periods < 2 {
            return BenchmarkComparison {
                common_periods,
                ..BenchmarkComparison::default()
            };
        }

        let covariance = ours.iter().covariance(theirs.iter());
        let benchmark_variance = theirs.iter().variance();
        let beta = if benchmark_variance > ZERO_VOLATILITY {
            covariance / benchmark_variance
        } else {
            0.0
        };

        let ours_annual = ours.iter().mean() * TRADING_DAYS_PER_YEAR;
        let theirs_annual = theirs.iter().mean() * TRADING_DAYS_PER_YEAR;
        let excess_return = ours_annual - theirs_annual;
        let alpha = ours_annual - (self.risk_free_rate + beta * (theirs_annual - self.risk_free_rate));

        let active: Vec<f64> = ours.iter().zip(&theirs).map(|(p, b)| p - b).collect();
        let tracking_error = active.iter().std_dev() * TRADING_DAYS_PER_YEAR.sqrt();
        let information_ratio = if tracking_error > ZERO_VOLATILITY {
            excess_return / tracking_error
        } else {
            0.0
        };

        let spread = ours.iter().std_dev() * theirs.iter().std_dev();
        let correlation = if spread > ZERO_VOLATILITY * ZERO_VOLATILITY {
            covariance / spread
        } else {
            0.0
        };

        BenchmarkComparison {
            excess_return,
            beta,
            alpha,
            tracking_error: finite_or_zero(tracking_error),
            information_ratio,
            correlation,
            common_periods,
        }
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

pub fn total_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

/// Compounded growth rescaled to 252 periods per year.
pub fn annualized_return(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let growth = 1.0 + total_return(returns);
    if growth <= 0.0 {
        return -1.0;
    }
    growth.powf(TRADING_DAYS_PER_YEAR / returns.len() as f64) - 1.0
}

pub fn annualized_volatility(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    finite_or_zero(returns.iter().std_dev() * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Annualized Sharpe ratio of daily returns against an annual risk-free rate.
/// Zero when the excess returns do not vary.
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let excess: Vec<f64> = returns.iter().map(|r| r - daily_rf).collect();
    let deviation = excess.iter().std_dev();
    if !deviation.is_finite() || deviation <= ZERO_VOLATILITY {
        return 0.0;
    }
    excess.iter().mean() / deviation * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Zero without losing periods (returns below zero); `+inf` when losses exist
/// but do not vary and the mean excess return is positive. The downside
/// deviation is taken over the excess returns of the losing periods.
pub fn sortino_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let excess: Vec<f64> = returns.iter().map(|r| r - daily_rf).collect();
    let downside: Vec<f64> = returns
        .iter()
        .filter(|r| **r < 0.0)
        .map(|r| r - daily_rf)
        .collect();
    if downside.is_empty() {
        return 0.0;
    }
    let mean_excess = excess.iter().mean();
    let downside_deviation = if downside.len() < 2 {
        0.0
    } else {
        finite_or_zero(downside.iter().std_dev())
    };
    if downside_deviation <= ZERO_VOLATILITY {
        return if mean_excess > 0.0 { f64::INFINITY } else { 0.0 };
    }
    mean_excess / downside_deviation * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Maximum drawdown (non-positive) and the longest underwater stretch.
pub fn max_drawdown(returns: &[f64]) -> (f64, usize) {
    let mut wealth = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut worst = 0.0_f64;
    let mut run = 0usize;
    let mut longest = 0usize;
    for r in returns {
        wealth *= 1.0 + r;
        peak = peak.max(wealth);
        let drawdown = if peak > 0.0 { wealth / peak - 1.0 } else { 0.0 };
        worst = worst.min(drawdown);
        if drawdown < -ZERO_VOLATILITY {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    (worst, longest)
}

/// Empirical VaR at `alpha` (linear interpolation between order statistics)
/// and the mean of returns at or below it.
pub fn value_at_risk(returns: &[f64], alpha: f64) -> (f64, f64) {
    if returns.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let position = alpha * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    let var = sorted[lower] + (sorted[upper] - sorted[lower]) * fraction;
    let tail: Vec<f64> = sorted.iter().copied().filter(|r| *r <= var).collect();
    let cvar = if tail.is_empty() { var } else { tail.iter().mean() };
    (var, cvar)
}

pub fn profit_factor(returns: &[f64]) -> f64 {
    let gains: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let losses: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    if losses > 0.0 {
        gains / losses
    } else if gains > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

fn longest_run(returns: &[f64], predicate: impl Fn(f64) -> bool) -> usize {
    let mut run = 0;
    let mut longest = 0;
    for r in returns {
        if predicate(*r) {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

fn period_stats(returns: &[(NaiveDate, f64)], period: ResamplePeriod) -> PeriodStats {
    let mut buckets: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for (date, r) in returns {
        let growth = buckets.entry(period_key(*date, period)).or_insert(1.0);
        *growth *= 1.0 + r;
    }
    let compounded: Vec<f64> = buckets.values().map(|growth| growth - 1.0).collect();
    if compounded.is_empty() {
        return PeriodStats::default();
    }

    let hits = compounded.iter().filter(|r| **r > 0.0).count();
    PeriodStats {
        mean: compounded.iter().mean(),
        std: if compounded.len() < 2 {
            0.0
        } else {
            finite_or_zero(compounded.iter().std_dev())
        },
        hit_rate: hits as f64 / compounded.len() as f64,
        best: compounded.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        worst: compounded.iter().copied().fold(f64::INFINITY, f64::min),
        count: compounded.len(),
    }
}
