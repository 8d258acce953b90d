use crate::config::EngineRuntimeSettings;
use crate::error::SolverError;
use crate::models::WeightMap;
use crate::performance::{annualized_return, annualized_volatility, sharpe_ratio};
use crate::returns::{ReturnsMatrix, TRADING_DAYS_PER_YEAR};
use crate::solver::{
    ensure_positive_definite, minimize, minimize_variance, run_with_timeout, BoundedSimplex,
    LinearConstraint, Objective, SolverSettings,
};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const REBALANCING_INTERVALS: [usize; 6] = [1, 5, 21, 63, 126, 252];

const RISK_PARITY_MIN_WEIGHT: f64 = 0.01;
const RISK_PARITY_MAX_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    /// Annual risk-free rate.
    pub risk_free_rate: f64,
    pub solver: SolverSettings,
    /// Black-Litterman prior uncertainty scale.
    pub tau: f64,
    /// Black-Litterman risk aversion.
    pub risk_aversion: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.02,
            solver: SolverSettings::default(),
            tau: 0.05,
            risk_aversion: 2.5,
        }
    }
}

impl From<&EngineRuntimeSettings> for OptimizerSettings {
    fn from(settings: &EngineRuntimeSettings) -> Self {
        Self {
            risk_free_rate: settings.risk_free_rate,
            solver: SolverSettings {
                max_iterations: settings.solver_max_iterations,
                timeout: settings.solver_timeout,
                ..SolverSettings::default()
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskParityMethod {
    /// Inverse-volatility weights.
    Naive,
    /// Equal risk contribution solved numerically.
    Optimized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub target_return: f64,
    /// Annualized expected return of `weights`.
    pub expected_return: f64,
    /// Annualized volatility of `weights`.
    pub volatility: f64,
    pub weights: WeightMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EfficientFrontier {
    pub points: Vec<FrontierPoint>,
}

impl EfficientFrontier {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn returns(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.expected_return).collect()
    }

    pub fn volatilities(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.volatility).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceInstruction {
    pub action: RebalanceAction,
    pub current_weight: f64,
    pub target_weight: f64,
    pub weight_change: f64,
    pub trade_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalanceSimulation {
    pub returns: Vec<f64>,
    pub total_cost: f64,
    pub rebalances: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyEvaluation {
    pub interval: usize,
    pub sharpe_ratio: f64,
    pub annual_return: f64,
    pub annual_volatility: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalancingFrequencyAnalysis {
    pub optimal_interval: usize,
    pub evaluations: Vec<FrequencyEvaluation>,
}

/// Squared deviation of each risk contribution from an equal share of total risk.
struct RiskParityObjective {
    covariance: DMatrix<f64>,
}

impl RiskParityObjective {
    /// Marginal risk `Cov w`, volatility and risk contributions `w_i (Cov w)_i / vol`.
    fn decompose(&self, weights: &DVector<f64>) -> Option<(DVector<f64>, f64, DVector<f64>)> {
        let cov_w = &self.covariance * weights;
        let risk = weights.dot(&cov_w).max(0.0).sqrt();
        if risk <= 0.0 {
            return None;
        }
        let contributions = weights.component_mul(&cov_w) / risk;
        Some((cov_w, risk, contributions))
    }
}

impl Objective for RiskParityObjective {
    fn value(&self, weights: &DVector<f64>) -> f64 {
        let Some((_, risk, contributions)) = self.decompose(weights) else {
            return 0.0;
        };
        let target = risk / weights.len() as f64;
        contributions.map(|rc| (rc - target).powi(2)).sum()
    }

    fn gradient(&self, weights: &DVector<f64>) -> DVector<f64> {
        let Some((cov_w, risk, contributions)) = self.decompose(weights) else {
            return DVector::zeros(weights.len());
        };
        let n = weights.len() as f64;
        let errors = contributions.map(|rc| rc - risk / n);
        let along_marginal = errors.dot(&contributions) / risk + errors.sum() / n;
        (errors.component_mul(&cov_w) + &self.covariance * errors.component_mul(weights)
            - cov_w * along_marginal)
            * (2.0 / risk)
    }
}

/// Stateless weighting library. Every entry point returns weights summing to
/// one and degrades to a closed-form scheme when a solve fails.
#[derive(Debug, Clone, Default)]
pub struct PortfolioOptimizer {
    settings: OptimizerSettings,
}

impl PortfolioOptimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn equal_weight(symbols: &[String]) -> WeightMap {
        let unique: BTreeSet<&String> = symbols.iter().collect();
        if unique.is_empty() {
            return WeightMap::new();
        }
        let weight = 1.0 / unique.len() as f64;
        unique.into_iter().map(|s| (s.clone(), weight)).collect()
    }

    /// Weights proportional to positive market caps; equal weight when none are usable.
    pub fn market_cap_weighted(market_caps: &BTreeMap<String, f64>) -> WeightMap {
        let total: f64 = market_caps
            .values()
            .filter(|cap| cap.is_finite() && **cap > 0.0)
            .sum();
        if total <= 0.0 {
            let symbols: Vec<String> = market_caps.keys().cloned().collect();
            return Self::equal_weight(&symbols);
        }
        market_caps
            .iter()
            .map(|(symbol, cap)| {
                let usable = if cap.is_finite() && *cap > 0.0 { *cap } else { 0.0 };
                (symbol.clone(), usable / total)
            })
            .collect()
    }

    /// Weights proportional to `1 / volatility`. Any zero or undefined volatility
    /// collapses the result to equal weight.
    pub fn inverse_volatility_weighted(returns: &ReturnsMatrix) -> WeightMap {
        let volatilities = returns.volatilities();
        if returns.n_periods() < 2
            || volatilities.iter().any(|vol| !vol.is_finite() || *vol <= 0.0)
        {
            return Self::equal_weight(returns.symbols());
        }
        let inverse = volatilities.map(|vol| 1.0 / vol);
        to_weight_map(returns.symbols(), &(&inverse / inverse.sum()))
    }

    pub fn risk_parity(&self, returns: &ReturnsMatrix, method: RiskParityMethod) -> WeightMap {
        let naive = Self::inverse_volatility_weighted(returns);
        if method == RiskParityMethod::Naive {
            return naive;
        }
        let start = DVector::from_iterator(
            returns.n_assets(),
            returns
                .symbols()
                .iter()
                .map(|s| naive.get(s).copied().unwrap_or(0.0)),
        );
        let solved = self.scaled_covariance(returns).and_then(|(covariance, _)| {
            let feasible = BoundedSimplex::new(
                returns.n_assets(),
                RISK_PARITY_MIN_WEIGHT,
                RISK_PARITY_MAX_WEIGHT,
            )?;
            self.solve_risk_parity(RiskParityObjective { covariance }, feasible, start)
        });
        match solved {
            Ok(weights) => to_weight_map(returns.symbols(), &weights),
            Err(e) => {
                warn!("Risk parity solve failed ({}); using inverse volatility", e);
                naive
            }
        }
    }

    pub fn minimum_variance_portfolio(&self, returns: &ReturnsMatrix) -> WeightMap {
        let solved = self.scaled_covariance(returns).and_then(|(covariance, _)| {
            let n = covariance.nrows();
            self.solve_variance(covariance, vec![LinearConstraint::budget(n)])
        });
        match solved {
            Ok(weights) => to_weight_map(returns.symbols(), &weights),
            Err(e) => {
                warn!("Minimum variance solve failed ({}); using equal weight", e);
                Self::equal_weight(returns.symbols())
            }
        }
    }

    /// Maximizes `w'sigma / sqrt(w' Cov w)`. The ratio is scale free, so this
    /// solves `min w' Cov w` subject to `w'sigma = 1, w >= 0` and normalizes.
    pub fn maximum_diversification_portfolio(&self, returns: &ReturnsMatrix) -> WeightMap {
        let solved = self.scaled_covariance(returns).and_then(|(covariance, _)| {
            let volatilities = covariance.diagonal().map(|v| v.max(0.0).sqrt());
            let raw =
                self.solve_variance(covariance, vec![LinearConstraint::Equal(volatilities, 1.0)])?;
            normalize_long_only(&raw).ok_or_else(|| {
                SolverError::Infeasible("diversification solve has no positive weights".to_string())
            })
        });
        match solved {
            Ok(weights) => to_weight_map(returns.symbols(), &weights),
            Err(e) => {
                warn!(
                    "Maximum diversification solve failed ({}); using equal weight",
                    e
                );
                Self::equal_weight(returns.symbols())
            }
        }
    }

    /// Minimum-variance portfolios for `n_portfolios` target returns spaced evenly
    /// between the lowest and highest mean asset return. Targets that cannot be
    /// solved are left out.
    pub fn efficient_frontier(&self, returns: &ReturnsMatrix, n_portfolios: usize) -> EfficientFrontier {
        if n_portfolios == 0 || returns.n_assets() == 0 {
            return EfficientFrontier::default();
        }
        let (covariance, _) = match self.scaled_covariance(returns) {
            Ok(scaled) => scaled,
            Err(e) => {
                warn!("Efficient frontier unavailable: {}", e);
                return EfficientFrontier::default();
            }
        };
        let raw_covariance = returns.covariance();
        let mean_returns = returns.mean_returns();
        let mu_scale = mean_returns.amax();
        let mu_scale = if mu_scale > 0.0 { mu_scale } else { 1.0 };
        let scaled_mu = &mean_returns / mu_scale;

        let lowest = mean_returns.min();
        let highest = mean_returns.max();
        let targets: Vec<f64> = if n_portfolios == 1 {
            vec![lowest]
        } else {
            let step = (highest - lowest) / (n_portfolios - 1) as f64;
            (0..n_portfolios).map(|i| lowest + step * i as f64).collect()
        };

        let points: Vec<FrontierPoint> = targets
            .par_iter()
            .filter_map(|target| {
                match self.frontier_weights(&covariance, &scaled_mu, target / mu_scale) {
                    Ok(weights) => {
                        let variance = weights.dot(&(&raw_covariance * &weights)).max(0.0);
                        Some(FrontierPoint {
                            target_return: *target,
                            expected_return: mean_returns.dot(&weights) * TRADING_DAYS_PER_YEAR,
                            volatility: (variance * TRADING_DAYS_PER_YEAR).sqrt(),
                            weights: to_weight_map(returns.symbols(), &weights),
                        })
                    }
                    Err(e) => {
                        debug!("Frontier target {:.6} skipped: {}", target, e);
                        None
                    }
                }
            })
            .collect();

        EfficientFrontier { points }
    }

    /// Minimum variance with `mu'w >= target`. At the top of the range only the
    /// highest-mean assets qualify, so that point is solved over them alone.
    fn frontier_weights(
        &self,
        covariance: &DMatrix<f64>,
        mu: &DVector<f64>,
        target: f64,
    ) -> Result<DVector<f64>, SolverError> {
        let n = mu.len();
        let best = mu.max();
        let slack = 1e-9 * best.abs().max(1.0);
        if target < best - slack {
            let constraints = vec![
                LinearConstraint::budget(n),
                LinearConstraint::AtLeast(mu.clone(), target),
            ];
            return self.solve_variance(covariance.clone(), constraints);
        }

        let leaders: Vec<usize> = (0..n).filter(|&i| mu[i] >= best - slack).collect();
        let mut weights = DVector::zeros(n);
        if let [only] = leaders.as_slice() {
            weights[*only] = 1.0;
            return Ok(weights);
        }
        let sub = covariance.select_rows(leaders.iter()).select_columns(leaders.iter());
        let solved = self.solve_variance(sub, vec![LinearConstraint::budget(leaders.len())])?;
        for (slot, idx) in leaders.iter().enumerate() {
            weights[*idx] = solved[slot];
        }
        Ok(weights)
    }

    /// Black-Litterman posterior weights from absolute annual return `views`.
    /// Views on symbols outside `returns` are ignored. Falls back to market-cap
    /// weights when there are no usable views or the algebra fails.
    pub fn black_litterman_optimization(
        &self,
        returns: &ReturnsMatrix,
        market_caps: &BTreeMap<String, f64>,
        views: &BTreeMap<String, f64>,
        view_confidence: f64,
    ) -> WeightMap {
        let caps: BTreeMap<String, f64> = returns
            .symbols()
            .iter()
            .map(|s| (s.clone(), market_caps.get(s).copied().unwrap_or(0.0)))
            .collect();
        let market_weights = Self::market_cap_weighted(&caps);

        let picks: Vec<(usize, f64)> = views
            .iter()
            .filter_map(|(symbol, view)| {
                let idx = returns.symbols().iter().position(|s| s == symbol)?;
                view.is_finite().then_some((idx, *view))
            })
            .collect();
        if picks.is_empty() {
            return market_weights;
        }

        match self.black_litterman_posterior(returns, &market_weights, &picks, view_confidence) {
            Ok(weights) => to_weight_map(returns.symbols(), &weights),
            Err(e) => {
                warn!("Black-Litterman failed ({}); using market-cap weights", e);
                market_weights
            }
        }
    }

    fn black_litterman_posterior(
        &self,
        returns: &ReturnsMatrix,
        market_weights: &WeightMap,
        picks: &[(usize, f64)],
        view_confidence: f64,
    ) -> Result<DVector<f64>, SolverError> {
        if !(view_confidence.is_finite() && view_confidence > 0.0) {
            return Err(SolverError::InvalidInput(format!(
                "view confidence must be positive (value: {})",
                view_confidence
            )));
        }
        let n = returns.n_assets();
        let sigma = returns.covariance() * TRADING_DAYS_PER_YEAR;
        ensure_positive_definite(&sigma)?;

        let w_mkt = DVector::from_iterator(
            n,
            returns
                .symbols()
                .iter()
                .map(|s| market_weights.get(s).copied().unwrap_or(0.0)),
        );
        let tau = self.settings.tau;
        let delta = self.settings.risk_aversion;
        let pi = &sigma * &w_mkt * delta;

        let k = picks.len();
        let mut p = DMatrix::zeros(k, n);
        let mut q = DVector::zeros(k);
        for (row, (idx, view)) in picks.iter().enumerate() {
            p[(row, *idx)] = 1.0;
            q[row] = *view;
        }

        let tau_sigma = &sigma * tau;
        let omega_diag = (&p * &tau_sigma * p.transpose()).diagonal() * view_confidence;
        if omega_diag.iter().any(|v| *v <= 0.0 || !v.is_finite()) {
            return Err(SolverError::Singular);
        }
        let omega_inv = DMatrix::from_diagonal(&omega_diag.map(|v| 1.0 / v));

        let tau_sigma_inv = tau_sigma.try_inverse().ok_or(SolverError::Singular)?;
        let precision = &tau_sigma_inv + p.transpose() * &omega_inv * &p;
        let posterior_cov = precision.try_inverse().ok_or(SolverError::Singular)?;
        let posterior_mu =
            posterior_cov * (&tau_sigma_inv * &pi + p.transpose() * &omega_inv * &q);

        let sigma_inv = (sigma * delta).try_inverse().ok_or(SolverError::Singular)?;
        let raw = sigma_inv * posterior_mu;
        normalize_long_only(&raw)
            .ok_or_else(|| SolverError::Infeasible("posterior has no positive weights".to_string()))
    }

    /// Unnormalized long-only Kelly fractions `Cov^-1 (mu - rf)` with gross
    /// exposure capped at `max_leverage`. Inputs are annualized.
    pub fn kelly_fractions(
        &self,
        expected_returns: &DVector<f64>,
        covariance: &DMatrix<f64>,
        max_leverage: f64,
    ) -> Result<DVector<f64>, SolverError> {
        if expected_returns.len() != covariance.nrows() {
            return Err(SolverError::InvalidInput(
                "expected returns and covariance disagree on asset count".to_string(),
            ));
        }
        if !(max_leverage.is_finite() && max_leverage > 0.0) {
            return Err(SolverError::InvalidInput(format!(
                "max leverage must be positive (value: {})",
                max_leverage
            )));
        }
        ensure_positive_definite(covariance)?;
        let inverse = covariance.clone().try_inverse().ok_or(SolverError::Singular)?;
        let excess = expected_returns.map(|mu| mu - self.settings.risk_free_rate);
        let mut fractions = (inverse * excess).map(|f| f.max(0.0));
        let gross = fractions.sum();
        if gross > max_leverage {
            fractions *= max_leverage / gross;
        }
        Ok(fractions)
    }

    pub fn kelly_criterion_weights(
        &self,
        symbols: &[String],
        expected_returns: &DVector<f64>,
        covariance: &DMatrix<f64>,
        max_leverage: f64,
    ) -> WeightMap {
        if symbols.len() != expected_returns.len() {
            warn!("Kelly inputs disagree on asset count; using equal weight");
            return Self::equal_weight(symbols);
        }
        let weights = self
            .kelly_fractions(expected_returns, covariance, max_leverage)
            .and_then(|fractions| {
                normalize_long_only(&fractions).ok_or_else(|| {
                    SolverError::Infeasible("no asset has a positive Kelly fraction".to_string())
                })
            });
        match weights {
            Ok(weights) => to_weight_map(symbols, &weights),
            Err(e) => {
                warn!("Kelly sizing failed ({}); using equal weight", e);
                Self::equal_weight(symbols)
            }
        }
    }

    /// Kelly weights from the annualized moments of a returns matrix.
    pub fn kelly_from_returns(&self, returns: &ReturnsMatrix, max_leverage: f64) -> WeightMap {
        let mu = returns.mean_returns() * TRADING_DAYS_PER_YEAR;
        let covariance = returns.covariance() * TRADING_DAYS_PER_YEAR;
        self.kelly_criterion_weights(returns.symbols(), &mu, &covariance, max_leverage)
    }

    /// Orders only for symbols whose weight drift exceeds `threshold`.
    pub fn calculate_rebalancing_trades(
        current_weights: &WeightMap,
        target_weights: &WeightMap,
        portfolio_value: f64,
        threshold: f64,
    ) -> BTreeMap<String, RebalanceInstruction> {
        let symbols: BTreeSet<&String> = current_weights.keys().chain(target_weights.keys()).collect();
        symbols
            .into_iter()
            .filter_map(|symbol| {
                let current = current_weights.get(symbol).copied().unwrap_or(0.0);
                let target = target_weights.get(symbol).copied().unwrap_or(0.0);
                let change = target - current;
                if change.abs() <= threshold {
                    return None;
                }
                let action = if change > 0.0 {
                    RebalanceAction::Buy
                } else {
                    RebalanceAction::Sell
                };
                Some((
                    symbol.clone(),
                    RebalanceInstruction {
                        action,
                        current_weight: current,
                        target_weight: target,
                        weight_change: change,
                        trade_value: change.abs() * portfolio_value,
                    },
                ))
            })
            .collect()
    }

    /// Drifts weights with realized returns and resets them to target every
    /// `interval` periods, charging `transaction_cost` on L1 turnover.
    pub fn simulate_rebalanced_returns(
        returns: &ReturnsMatrix,
        target_weights: &WeightMap,
        interval: usize,
        transaction_cost: f64,
    ) -> RebalanceSimulation {
        let target = DVector::from_iterator(
            returns.n_assets(),
            returns
                .symbols()
                .iter()
                .map(|s| target_weights.get(s).copied().unwrap_or(0.0)),
        );
        let interval = interval.max(1);
        let mut weights = target.clone();
        let mut simulation = RebalanceSimulation::default();

        for t in 0..returns.n_periods() {
            let mut cost = 0.0;
            if t > 0 && t % interval == 0 {
                let turnover: f64 = (&weights - &target).abs().sum();
                cost = transaction_cost * turnover;
                weights = target.clone();
                simulation.rebalances += 1;
            }
            let period = DVector::from_vec(returns.row(t));
            let gross = weights.dot(&period);
            simulation.returns.push(gross - cost);
            simulation.total_cost += cost;

            let growth = 1.0 + gross;
            if growth > 0.0 {
                weights = weights.component_mul(&period.map(|r| 1.0 + r)) / growth;
            }
        }
        simulation
    }

    /// Picks the candidate interval with the highest Sharpe ratio; ties go to
    /// the shorter interval.
    pub fn optimize_rebalancing_frequency(
        &self,
        returns: &ReturnsMatrix,
        target_weights: &WeightMap,
        transaction_cost: f64,
    ) -> RebalancingFrequencyAnalysis {
        let risk_free_rate = self.settings.risk_free_rate;
        let evaluations: Vec<FrequencyEvaluation> = REBALANCING_INTERVALS
            .par_iter()
            .map(|interval| {
                let simulation = Self::simulate_rebalanced_returns(
                    returns,
                    target_weights,
                    *interval,
                    transaction_cost,
                );
                FrequencyEvaluation {
                    interval: *interval,
                    sharpe_ratio: sharpe_ratio(&simulation.returns, risk_free_rate),
                    annual_return: annualized_return(&simulation.returns),
                    annual_volatility: annualized_volatility(&simulation.returns),
                    total_cost: simulation.total_cost,
                }
            })
            .collect();

        let mut optimal = &evaluations[0];
        for evaluation in &evaluations[1..] {
            if evaluation.sharpe_ratio > optimal.sharpe_ratio + 1e-12 {
                optimal = evaluation;
            }
        }
        let optimal_interval = optimal.interval;
        RebalancingFrequencyAnalysis {
            optimal_interval,
            evaluations,
        }
    }

    /// Covariance divided by its mean variance, plus that scale. Fails when the
    /// matrix is too short, degenerate, or not positive definite.
    fn scaled_covariance(&self, returns: &ReturnsMatrix) -> Result<(DMatrix<f64>, f64), SolverError> {
        if returns.n_assets() == 0 {
            return Err(SolverError::InvalidInput("no assets".to_string()));
        }
        if returns.n_periods() < 2 {
            return Err(SolverError::InvalidInput(
                "at least two return periods are required".to_string(),
            ));
        }
        let covariance = returns.covariance();
        let scale = covariance.diagonal().mean();
        if !(scale.is_finite() && scale > 0.0) {
            return Err(SolverError::NotPositiveDefinite);
        }
        let scaled = covariance / scale;
        ensure_positive_definite(&scaled)?;
        Ok((scaled, scale))
    }

    fn solve_variance(
        &self,
        covariance: DMatrix<f64>,
        constraints: Vec<LinearConstraint>,
    ) -> Result<DVector<f64>, SolverError> {
        let settings = self.settings.solver.clone();
        run_with_timeout(settings.timeout, move |_| {
            minimize_variance(&covariance, &constraints, &settings)
        })
    }

    fn solve_risk_parity(
        &self,
        objective: RiskParityObjective,
        feasible: BoundedSimplex,
        start: DVector<f64>,
    ) -> Result<DVector<f64>, SolverError> {
        let settings = self.settings.solver.clone();
        run_with_timeout(settings.timeout, move |cancel| {
            minimize(&objective, &feasible, &start, &settings, &cancel)
        })
    }
}

fn normalize_long_only(raw: &DVector<f64>) -> Option<DVector<f64>> {
    let clipped = raw.map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 });
    let total = clipped.sum();
    (total > 0.0).then(|| clipped / total)
}

/// Pairs weights with symbols, clearing solver noise below zero and renormalizing.
fn to_weight_map(symbols: &[String], weights: &DVector<f64>) -> WeightMap {
    let cleaned = weights.map(|w| w.max(0.0));
    let total = cleaned.sum();
    symbols
        .iter()
        .zip(cleaned.iter())
        .map(|(symbol, w)| {
            let weight = if total > 0.0 { w / total } else { 0.0 };
            (symbol.clone(), weight)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("S{}", i)).collect()
    }

    fn synthetic_returns(seed: u64, n_assets: usize, n_periods: usize) -> ReturnsMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let market: Vec<f64> = (0..n_periods).map(|_| rng.gen_range(-0.01..0.01)).collect();
        let columns = (0..n_assets)
            .map(|asset| {
                let drift = 0.0002 * (asset as f64 + 1.0);
                let scale = 0.5 + asset as f64 * 0.3;
                market
                    .iter()
                    .map(|m| drift + m * scale + rng.gen_range(-0.015..0.015) * scale)
                    .collect()
            })
            .collect();
        ReturnsMatrix::from_columns(names(n_assets), columns).unwrap()
    }

    /// One market factor with loadings 1.0, 1.5 and 0.7 plus independent noise,
    /// so every weighting scheme has an interior optimum.
    fn factor_returns(seed: u64) -> ReturnsMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let loadings = [1.0, 1.5, 0.7];
        let market: Vec<f64> = (0..250).map(|_| rng.gen_range(-0.01..0.01)).collect();
        let columns = loadings
            .iter()
            .enumerate()
            .map(|(asset, k)| {
                let drift = 0.0003 * (asset as f64 + 1.0);
                market
                    .iter()
                    .map(|m| drift + k * m + rng.gen_range(-0.02..0.02))
                    .collect()
            })
            .collect();
        ReturnsMatrix::from_columns(names(3), columns).unwrap()
    }

    fn as_vector(returns: &ReturnsMatrix, weights: &WeightMap) -> DVector<f64> {
        DVector::from_iterator(
            returns.n_assets(),
            returns.symbols().iter().map(|s| weights[s]),
        )
    }

    fn max_abs_gap(left: &WeightMap, right: &WeightMap) -> f64 {
        left.iter()
            .map(|(symbol, w)| (w - right[symbol]).abs())
            .fold(0.0, f64::max)
    }

    fn no_time_budget() -> PortfolioOptimizer {
        PortfolioOptimizer::new(OptimizerSettings {
            solver: SolverSettings {
                timeout: std::time::Duration::ZERO,
                ..SolverSettings::default()
            },
            ..OptimizerSettings::default()
        })
    }

    fn assert_valid_weights(weights: &WeightMap) {
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6, "weights sum to {}", total);
        assert!(weights.values().all(|w| *w >= -1e-12));
    }

    fn portfolio_vol(returns: &ReturnsMatrix, weights: &WeightMap) -> f64 {
        let w = DVector::from_iterator(
            returns.n_assets(),
            returns.symbols().iter().map(|s| weights[s]),
        );
        w.dot(&(returns.covariance() * &w)).max(0.0).sqrt()
    }

    #[test]
    fn closed_form_weights_sum_to_one() {
        let returns = synthetic_returns(7, 4, 120);
        assert_valid_weights(&PortfolioOptimizer::equal_weight(returns.symbols()));
        assert_valid_weights(&PortfolioOptimizer::inverse_volatility_weighted(&returns));

        let mut caps = BTreeMap::new();
        caps.insert("A".to_string(), 300.0);
        caps.insert("B".to_string(), 100.0);
        caps.insert("C".to_string(), f64::NAN);
        let weights = PortfolioOptimizer::market_cap_weighted(&caps);
        assert!((weights["A"] - 0.75).abs() < 1e-12);
        assert_eq!(weights["C"], 0.0);
    }

    #[test]
    fn inverse_volatility_favours_quieter_assets() {
        let returns = synthetic_returns(11, 3, 200);
        let weights = PortfolioOptimizer::inverse_volatility_weighted(&returns);
        assert!(weights["S0"] > weights["S2"]);
    }

    #[test]
    fn zero_volatility_asset_falls_back_to_equal_weight() {
        let returns = ReturnsMatrix::from_columns(
            names(2),
            vec![vec![0.01, -0.01, 0.02], vec![0.0, 0.0, 0.0]],
        )
        .unwrap();
        let weights = PortfolioOptimizer::inverse_volatility_weighted(&returns);
        assert!((weights["S0"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn optimized_weights_are_long_only_and_normalized() {
        let optimizer = PortfolioOptimizer::default();
        let returns = synthetic_returns(3, 4, 250);
        let risk_parity = optimizer.risk_parity(&returns, RiskParityMethod::Optimized);
        assert_valid_weights(&risk_parity);
        assert!(risk_parity.values().all(|w| *w >= 0.01 - 1e-9 && *w <= 0.5 + 1e-9));
        assert_valid_weights(&optimizer.minimum_variance_portfolio(&returns));
        assert_valid_weights(&optimizer.maximum_diversification_portfolio(&returns));
    }

    #[test]
    fn minimum_variance_beats_equal_weight() {
        let optimizer = PortfolioOptimizer::default();
        let returns = synthetic_returns(5, 3, 250);
        let min_var = optimizer.minimum_variance_portfolio(&returns);
        let equal = PortfolioOptimizer::equal_weight(returns.symbols());
        assert!(portfolio_vol(&returns, &min_var) <= portfolio_vol(&returns, &equal) + 1e-12);
    }

    #[test]
    fn minimum_variance_matches_closed_form_on_factor_data() {
        let optimizer = PortfolioOptimizer::default();
        for seed in 1..=5 {
            let returns = factor_returns(seed);
            let solved = optimizer.minimum_variance_portfolio(&returns);

            let covariance = returns.covariance();
            let inverse_ones =
                covariance.try_inverse().unwrap() * DVector::from_element(returns.n_assets(), 1.0);
            let expected = &inverse_ones / inverse_ones.sum();
            assert!(expected.iter().all(|w| *w > 0.05), "seed {}: {}", seed, expected);

            let solved_vec = as_vector(&returns, &solved);
            for i in 0..returns.n_assets() {
                assert!(
                    (solved_vec[i] - expected[i]).abs() < 1e-4,
                    "seed {}: {} vs {}",
                    seed,
                    solved_vec,
                    expected
                );
            }
            let equal = PortfolioOptimizer::equal_weight(returns.symbols());
            assert!(max_abs_gap(&solved, &equal) > 1e-2);
        }
    }

    #[test]
    fn maximum_diversification_raises_the_ratio() {
        let optimizer = PortfolioOptimizer::default();
        let ratio = |returns: &ReturnsMatrix, weights: &WeightMap| {
            let w = as_vector(returns, weights);
            w.dot(&returns.volatilities()) / portfolio_vol(returns, weights)
        };
        for seed in 1..=5 {
            let returns = factor_returns(seed);
            let solved = optimizer.maximum_diversification_portfolio(&returns);
            let equal = PortfolioOptimizer::equal_weight(returns.symbols());
            assert_valid_weights(&solved);
            assert!(max_abs_gap(&solved, &equal) > 1e-3);
            assert!(ratio(&returns, &solved) > ratio(&returns, &equal));
        }
    }

    #[test]
    fn risk_parity_equalizes_risk_contributions() {
        let optimizer = PortfolioOptimizer::default();
        for seed in 1..=5 {
            let returns = factor_returns(seed);
            let weights = optimizer.risk_parity(&returns, RiskParityMethod::Optimized);
            assert_valid_weights(&weights);

            let w = as_vector(&returns, &weights);
            let contributions = w.component_mul(&(returns.covariance() * &w));
            let spread = contributions.max() / contributions.min() - 1.0;
            assert!(spread < 1e-2, "seed {}: contributions {}", seed, contributions);
        }
    }

    #[test]
    fn risk_parity_gradient_matches_finite_differences() {
        let returns = factor_returns(2);
        let objective = RiskParityObjective {
            covariance: returns.covariance() * 1e4,
        };
        let w = DVector::from_vec(vec![0.5, 0.2, 0.3]);
        let analytic = objective.gradient(&w);
        let h = 1e-6;
        for i in 0..3 {
            let mut up = w.clone();
            let mut down = w.clone();
            up[i] += h;
            down[i] -= h;
            let numeric = (objective.value(&up) - objective.value(&down)) / (2.0 * h);
            assert!(
                (analytic[i] - numeric).abs() < 1e-6 * numeric.abs().max(1.0),
                "component {}: {} vs {}",
                i,
                analytic[i],
                numeric
            );
        }
    }

    #[test]
    fn exhausted_time_budget_uses_fallbacks() {
        let optimizer = no_time_budget();
        let returns = factor_returns(3);
        let equal = PortfolioOptimizer::equal_weight(returns.symbols());

        assert_eq!(
            optimizer.risk_parity(&returns, RiskParityMethod::Optimized),
            PortfolioOptimizer::inverse_volatility_weighted(&returns)
        );
        assert_eq!(optimizer.minimum_variance_portfolio(&returns), equal);
        assert_eq!(optimizer.maximum_diversification_portfolio(&returns), equal);
        // Only the top point, a single asset, is known without solving.
        let frontier = optimizer.efficient_frontier(&returns, 5);
        assert_eq!(frontier.len(), 1);
        assert!(frontier.points[0].weights.values().any(|w| (*w - 1.0).abs() < 1e-12));
    }

    #[test]
    fn singular_covariance_triggers_documented_fallbacks() {
        let base = vec![0.01, -0.02, 0.015, 0.003, -0.007, 0.012];
        let mirrored: Vec<f64> = base.iter().map(|r| -r).collect();
        let returns =
            ReturnsMatrix::from_columns(names(2), vec![base.clone(), mirrored]).unwrap();
        let optimizer = PortfolioOptimizer::default();

        let risk_parity = optimizer.risk_parity(&returns, RiskParityMethod::Optimized);
        assert_eq!(risk_parity, PortfolioOptimizer::inverse_volatility_weighted(&returns));

        let min_var = optimizer.minimum_variance_portfolio(&returns);
        assert_eq!(min_var, PortfolioOptimizer::equal_weight(returns.symbols()));

        let mut caps = BTreeMap::new();
        caps.insert("S0".to_string(), 3.0);
        caps.insert("S1".to_string(), 1.0);
        let mut views = BTreeMap::new();
        views.insert("S0".to_string(), 0.10);
        let bl = optimizer.black_litterman_optimization(&returns, &caps, &views, 1.0);
        assert!((bl["S0"] - 0.75).abs() < 1e-12);
        assert!((bl["S1"] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn negatively_correlated_pair_risk_parity_reduces_volatility() {
        let base = vec![0.01, -0.02, 0.015, 0.003, -0.007, 0.012, -0.004, 0.009];
        let mirrored: Vec<f64> = base.iter().map(|r| -2.0 * r).collect();
        let returns = ReturnsMatrix::from_columns(names(2), vec![base, mirrored]).unwrap();
        let weights = PortfolioOptimizer::default().risk_parity(&returns, RiskParityMethod::Optimized);
        assert_valid_weights(&weights);

        let combined = portfolio_vol(&returns, &weights);
        let vols = returns.volatilities();
        assert!(combined < vols[0]);
        assert!(combined < vols[1]);
    }

    #[test]
    fn efficient_frontier_volatility_is_non_decreasing() {
        let optimizer = PortfolioOptimizer::default();
        let returns = synthetic_returns(21, 4, 300);
        let frontier = optimizer.efficient_frontier(&returns, 10);
        assert_eq!(frontier.len(), 10);
        let vols = frontier.volatilities();
        for pair in vols.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-6, "{:?}", vols);
        }
        for point in &frontier.points {
            assert_valid_weights(&point.weights);
        }
    }

    #[test]
    fn efficient_frontier_solves_every_target_on_factor_data() {
        let optimizer = PortfolioOptimizer::default();
        for seed in 1..=5 {
            let returns = factor_returns(seed);
            let frontier = optimizer.efficient_frontier(&returns, 10);
            assert_eq!(frontier.len(), 10, "seed {}", seed);

            let annual_means = returns.mean_returns() * TRADING_DAYS_PER_YEAR;
            let top = frontier.points.last().unwrap();
            assert!((top.expected_return - annual_means.max()).abs() < 1e-6);
            for point in &frontier.points {
                assert!(point.expected_return >= point.target_return * TRADING_DAYS_PER_YEAR - 1e-6);
            }
        }
    }

    #[test]
    fn black_litterman_without_views_returns_market_weights() {
        let optimizer = PortfolioOptimizer::default();
        let returns = synthetic_returns(9, 3, 120);
        let mut caps = BTreeMap::new();
        caps.insert("S0".to_string(), 2.0);
        caps.insert("S1".to_string(), 1.0);
        caps.insert("S2".to_string(), 1.0);
        let weights = optimizer.black_litterman_optimization(&returns, &caps, &BTreeMap::new(), 1.0);
        assert!((weights["S0"] - 0.5).abs() < 1e-12);

        let mut unknown = BTreeMap::new();
        unknown.insert("ZZZ".to_string(), 0.5);
        let ignored = optimizer.black_litterman_optimization(&returns, &caps, &unknown, 1.0);
        assert_eq!(ignored, weights);
    }

    #[test]
    fn bullish_view_raises_weight() {
        let optimizer = PortfolioOptimizer::default();
        let returns = synthetic_returns(13, 3, 250);
        let mut caps = BTreeMap::new();
        for symbol in returns.symbols() {
            caps.insert(symbol.clone(), 1.0);
        }
        let neutral = optimizer.black_litterman_optimization(&returns, &caps, &BTreeMap::new(), 1.0);
        let mut views = BTreeMap::new();
        views.insert("S1".to_string(), 0.60);
        let tilted = optimizer.black_litterman_optimization(&returns, &caps, &views, 0.5);
        assert_valid_weights(&tilted);
        assert!(tilted["S1"] > neutral["S1"]);
    }

    #[test]
    fn kelly_caps_gross_leverage_then_normalizes() {
        let optimizer = PortfolioOptimizer::new(OptimizerSettings {
            risk_free_rate: 0.0,
            ..OptimizerSettings::default()
        });
        let mu = DVector::from_vec(vec![0.10, 0.20]);
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.04]);

        let fractions = optimizer.kelly_fractions(&mu, &cov, 2.0).unwrap();
        assert!((fractions.sum() - 2.0).abs() < 1e-9);
        assert!((fractions[1] / fractions[0] - 2.0).abs() < 1e-9);

        let uncapped = optimizer.kelly_fractions(&mu, &cov, 100.0).unwrap();
        assert!((uncapped[0] - 2.5).abs() < 1e-9);

        let symbols = names(2);
        let weights = optimizer.kelly_criterion_weights(&symbols, &mu, &cov, 2.0);
        assert!((weights["S0"] - 1.0 / 3.0).abs() < 1e-9);
        assert!((weights["S1"] - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn kelly_without_positive_edge_uses_equal_weight() {
        let optimizer = PortfolioOptimizer::default();
        let mu = DVector::from_vec(vec![-0.1, -0.2]);
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.04]);
        let weights = optimizer.kelly_criterion_weights(&names(2), &mu, &cov, 1.0);
        assert!((weights["S0"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn identical_weights_need_no_trades() {
        let mut weights = WeightMap::new();
        weights.insert("A".to_string(), 0.4);
        weights.insert("B".to_string(), 0.6);
        let trades =
            PortfolioOptimizer::calculate_rebalancing_trades(&weights, &weights, 1_000_000.0, 1e-6);
        assert!(trades.is_empty());
    }

    #[test]
    fn rebalancing_trades_respect_threshold() {
        let mut current = WeightMap::new();
        current.insert("A".to_string(), 0.50);
        current.insert("B".to_string(), 0.50);
        let mut target = WeightMap::new();
        target.insert("A".to_string(), 0.52);
        target.insert("C".to_string(), 0.48);
        let trades =
            PortfolioOptimizer::calculate_rebalancing_trades(&current, &target, 10_000.0, 0.05);
        assert_eq!(trades.len(), 2);
        assert!(!trades.contains_key("A"));
        assert_eq!(trades["B"].action, RebalanceAction::Sell);
        assert!((trades["C"].trade_value - 4_800.0).abs() < 1e-9);
    }

    #[test]
    fn rebalanced_simulation_charges_turnover() {
        let returns = ReturnsMatrix::from_columns(
            names(2),
            vec![vec![0.10, 0.0, 0.0], vec![-0.10, 0.0, 0.0]],
        )
        .unwrap();
        let mut target = WeightMap::new();
        target.insert("S0".to_string(), 0.5);
        target.insert("S1".to_string(), 0.5);
        let simulation = PortfolioOptimizer::simulate_rebalanced_returns(&returns, &target, 1, 0.01);
        assert_eq!(simulation.rebalances, 2);
        // After period one the weights drift to 0.55 / 0.45.
        assert!((simulation.returns[1] + 0.001).abs() < 1e-12);
        assert!((simulation.total_cost - 0.001).abs() < 1e-12);
    }

    #[test]
    fn rebalancing_frequency_prefers_cheaper_schedule_when_costs_dominate() {
        let optimizer = PortfolioOptimizer::default();
        let returns = synthetic_returns(17, 3, 504);
        let target = PortfolioOptimizer::equal_weight(returns.symbols());
        let analysis = optimizer.optimize_rebalancing_frequency(&returns, &target, 0.05);
        assert_eq!(analysis.evaluations.len(), REBALANCING_INTERVALS.len());
        assert!(REBALANCING_INTERVALS.contains(&analysis.optimal_interval));
        let daily = &analysis.evaluations[0];
        assert!(daily.total_cost > analysis.evaluations[5].total_cost);
        assert_ne!(analysis.optimal_interval, 1);
    }
}
