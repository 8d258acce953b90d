use crate::error::SolverError;
use crossbeam_channel::{bounded, RecvTimeoutError};
use log::debug;
use nalgebra::{DMatrix, DVector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAX_STEP: f64 = 100.0;
const MIN_STEP: f64 = 1e-16;

#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub timeout: Duration,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5_000,
            tolerance: 1e-9,
            timeout: Duration::from_millis(5_000),
        }
    }
}

/// Shared flag a timed-out caller uses to stop an abandoned solve.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Smooth objective over portfolio weights.
pub trait Objective {
    fn value(&self, weights: &DVector<f64>) -> f64;

    fn gradient(&self, weights: &DVector<f64>) -> DVector<f64>;
}

/// Linear side constraint on the weight vector.
#[derive(Debug, Clone)]
pub enum LinearConstraint {
    /// `coefficients' w = bound`
    Equal(DVector<f64>, f64),
    /// `coefficients' w >= bound`
    AtLeast(DVector<f64>, f64),
}

impl LinearConstraint {
    /// `sum(w) = 1`.
    pub fn budget(n: usize) -> Self {
        Self::Equal(DVector::from_element(n, 1.0), 1.0)
    }

    fn coefficients(&self) -> &DVector<f64> {
        match self {
            Self::Equal(coefficients, _) | Self::AtLeast(coefficients, _) => coefficients,
        }
    }

    /// Row of `A` and entry of `b` in the conic form `A w + s = b`.
    fn conic_row(&self) -> (DVector<f64>, f64) {
        match self {
            Self::Equal(coefficients, bound) => (coefficients.clone(), *bound),
            Self::AtLeast(coefficients, bound) => (-coefficients, -bound),
        }
    }
}

/// Long-only variance minimization `min w' Cov w` subject to `w >= 0` and
/// `constraints`, solved as a conic quadratic program.
pub fn minimize_variance(
    covariance: &DMatrix<f64>,
    constraints: &[LinearConstraint],
    settings: &SolverSettings,
) -> Result<DVector<f64>, SolverError> {
    use clarabel::algebra::*;
    use clarabel::solver::*;
    use crate::error::SolverError;

    let n = covariance.nrows();
    if n == 0 || !covariance.is_square() {
        return Err(SolverError::InvalidInput(
            "covariance matrix must be square and non-empty".to_string(),
        ));
    }
    if constraints.iter().any(|c| c.coefficients().len() != n) {
        return Err(SolverError::InvalidInput(
            "constraint has the wrong number of coefficients".to_string(),
        ));
    }

    // Upper triangle of the covariance, column by column.
    let mut p_data = Vec::new();
    let mut p_indices = Vec::new();
    let mut p_indptr = vec![0];
    for j in 0..n {
        for i in 0..=j {
            let value = covariance[(i, j)];
            if value != 0.0 {
                p_data.push(value);
                p_indices.push(i);
            }
        }
        p_indptr.push(p_data.len());
    }
    let p = CscMatrix::new(n, n, p_indptr, p_indices, p_data);
    let q = vec![0.0; n];

    // Equalities first so they line up with the zero cone.
    let (equalities, inequalities): (Vec<&LinearConstraint>, Vec<&LinearConstraint>) = constraints
        .iter()
        .partition(|c| matches!(c, LinearConstraint::Equal(..)));
    let rows: Vec<(DVector<f64>, f64)> = equalities
        .iter()
        .chain(inequalities.iter())
        .map(|c| c.conic_row())
        .collect();
    let n_rows = rows.len();

    let mut a_data = Vec::new();
    let mut a_indices = Vec::new();
    let mut a_indptr = vec![0];
    for j in 0..n {
        for (row, (coefficients, _)) in rows.iter().enumerate() {
            if coefficients[j] != 0.0 {
                a_data.push(coefficients[j]);
                a_indices.push(row);
            }
        }
        // -w_j <= 0
        a_data.push(-1.0);
        a_indices.push(n_rows + j);
        a_indptr.push(a_data.len());
    }
    let a = CscMatrix::new(n_rows + n, n, a_indptr, a_indices, a_data);

    let mut b: Vec<f64> = rows.iter().map(|(_, bound)| *bound).collect();
    b.extend(vec![0.0; n]);

    let mut cones = Vec::new();
    if !equalities.is_empty() {
        cones.push(ZeroConeT(equalities.len()));
    }
    cones.push(NonnegativeConeT(inequalities.len() + n));

    let qp_settings = DefaultSettingsBuilder::default()
        .max_iter(u32::try_from(settings.max_iterations).unwrap_or(u32::MAX))
        .time_limit(settings.timeout.as_secs_f64())
        .verbose(false)
        .build()
        .map_err(|e| SolverError::InvalidInput(format!("failed to build QP settings: {}", e)))?;

    let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, qp_settings)
        .map_err(|e| SolverError::InvalidInput(format!("failed to set up QP: {:?}", e)))?;
    solver.solve();

    match solver.solution.status {
        SolverStatus::Solved => {
            debug!("QP solved in {} iterations", solver.solution.iterations);
            Ok(DVector::from_vec(solver.solution.x.clone()))
        }
        SolverStatus::PrimalInfeasible => Err(SolverError::Infeasible(
            "no long-only portfolio meets the constraints".to_string(),
        )),
        SolverStatus::MaxTime => Err(SolverError::Timeout(settings.timeout)),
        status => {
            debug!("QP stopped with status {:?}", status);
            Err(SolverError::DidNotConverge {
                iterations: solver.solution.iterations as usize,
            })
        }
    }
}

/// `{ w : lower <= w_i <= upper, sum(w) = 1 }`.
#[derive(Debug, Clone)]
pub struct BoundedSimplex {
    n: usize,
    lower: f64,
    upper: f64,
}

impl BoundedSimplex {
    pub fn new(n: usize, lower: f64, upper: f64) -> Result<Self, SolverError> {
        if n == 0 {
            return Err(SolverError::InvalidInput("no assets to weight".to_string()));
        }
        if !(lower.is_finite() && upper.is_finite()) || lower > upper {
            return Err(SolverError::InvalidInput(format!(
                "weight bounds [{}, {}] are invalid",
                lower, upper
            )));
        }
        let count = n as f64;
        if count * lower > 1.0 + 1e-12 || count * upper < 1.0 - 1e-12 {
            return Err(SolverError::Infeasible(format!(
                "{} weights in [{}, {}] cannot sum to one",
                n, lower, upper
            )));
        }
        Ok(Self { n, lower, upper })
    }

    /// Exact projection onto the box-bounded simplex. The clamped sum is
    /// piecewise linear in the shift `tau`, so the root lies between two
    /// adjacent breakpoints.
    pub fn project(&self, v: &DVector<f64>) -> DVector<f64> {
        let shifted = |tau: f64| v.map(|x| (x - tau).clamp(self.lower, self.upper));
        let mut breakpoints: Vec<f64> = v
            .iter()
            .flat_map(|x| [x - self.lower, x - self.upper])
            .collect();
        breakpoints.sort_by(|a, b| a.total_cmp(b));

        let mut lo = 0;
        let mut hi = breakpoints.len() - 1;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if shifted(breakpoints[mid]).sum() >= 1.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let (a, b) = (breakpoints[lo], breakpoints[hi]);
        let (sum_a, sum_b) = (shifted(a).sum(), shifted(b).sum());
        let tau = if sum_a - sum_b > f64::EPSILON {
            a + (sum_a - 1.0) * (b - a) / (sum_a - sum_b)
        } else {
            a
        };
        shifted(tau)
    }
}

/// Projected gradient descent with a backtracking step size, started from the
/// projection of `start`. Stops when a unit projected-gradient step no longer
/// moves the point, or when an accepted step improves the objective by less
/// than `tolerance` relative to its size.
pub fn minimize<O: Objective + ?Sized>(
    objective: &O,
    feasible: &BoundedSimplex,
    start: &DVector<f64>,
    settings: &SolverSettings,
    cancel: &CancelFlag,
) -> Result<DVector<f64>, SolverError> {
    if start.len() != feasible.n {
        return Err(SolverError::InvalidInput(
            "starting point has the wrong length".to_string(),
        ));
    }
    let mut x = feasible.project(start);
    let mut fx = objective.value(&x);
    if !fx.is_finite() {
        return Err(SolverError::InvalidInput(
            "objective is not finite at the starting point".to_string(),
        ));
    }
    let mut step: f64 = 1.0;

    for iteration in 0..settings.max_iterations {
        if cancel.is_cancelled() {
            return Err(SolverError::Timeout(settings.timeout));
        }
        let gradient = objective.gradient(&x);
        let stationarity = (feasible.project(&(&x - &gradient)) - &x).amax();
        if stationarity <= settings.tolerance {
            debug!("solver stationary after {} iterations", iteration);
            return Ok(x);
        }

        let mut accepted = None;
        while step >= MIN_STEP {
            let candidate = feasible.project(&(&x - &gradient * step));
            let delta = &candidate - &x;
            let value = objective.value(&candidate);
            let bound = fx + gradient.dot(&delta) + delta.norm_squared() / (2.0 * step);
            if value.is_finite() && value <= bound {
                accepted = Some((candidate, value));
                break;
            }
            step *= 0.5;
        }
        let Some((candidate, value)) = accepted else {
            // No representable step decreases the objective any further.
            debug!("solver step underflow after {} iterations", iteration + 1);
            return Ok(x);
        };

        let improvement = fx - value;
        x = candidate;
        fx = value;
        if improvement <= settings.tolerance * fx.abs().max(1.0) {
            debug!("solver converged after {} iterations", iteration + 1);
            return Ok(x);
        }
        step = (step * 1.5).min(MAX_STEP);
    }

    Err(SolverError::DidNotConverge {
        iterations: settings.max_iterations,
    })
}

/// Fails unless `matrix` is square, finite, symmetric and well-conditioned.
pub fn ensure_positive_definite(matrix: &DMatrix<f64>) -> Result<(), SolverError> {
    if !matrix.is_square() || matrix.nrows() == 0 {
        return Err(SolverError::InvalidInput(
            "covariance matrix must be square and non-empty".to_string(),
        ));
    }
    if matrix.iter().any(|value| !value.is_finite()) {
        return Err(SolverError::InvalidInput(
            "covariance matrix contains non-finite values".to_string(),
        ));
    }
    let scale = matrix.amax().max(f64::MIN_POSITIVE);
    if (matrix - matrix.transpose()).amax() > scale * 1e-9 {
        return Err(SolverError::InvalidInput(
            "covariance matrix is not symmetric".to_string(),
        ));
    }
    let eigenvalues = matrix.clone().symmetric_eigen().eigenvalues;
    let largest = eigenvalues.max();
    let smallest = eigenvalues.min();
    if largest <= 0.0 || smallest <= largest * 1e-10 {
        return Err(SolverError::NotPositiveDefinite);
    }
    Ok(())
}

/// Runs `job` on a worker thread and gives up after `timeout`. The job
/// receives a flag that is raised when the caller stops waiting. A zero
/// budget times out without starting the job.
pub fn run_with_timeout<T, F>(timeout: Duration, job: F) -> Result<T, SolverError>
where
    T: Send + 'static,
    F: FnOnce(CancelFlag) -> Result<T, SolverError> + Send + 'static,
{
    if timeout.is_zero() {
        return Err(SolverError::Timeout(timeout));
    }
    let cancel = CancelFlag::new();
    let worker_flag = cancel.clone();
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("solver".to_string())
        .spawn(move || {
            let _ = tx.send(job(worker_flag));
        })
        .map_err(|e| SolverError::InvalidInput(format!("failed to spawn solver thread: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            cancel.cancel();
            Err(SolverError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(SolverError::InvalidInput(
            "solver thread exited without a result".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic {
        target: DVector<f64>,
    }

    impl Objective for Quadratic {
        fn value(&self, weights: &DVector<f64>) -> f64 {
            (weights - &self.target).norm_squared()
        }

        fn gradient(&self, weights: &DVector<f64>) -> DVector<f64> {
            (weights - &self.target) * 2.0
        }
    }

    fn correlated_covariance() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            3,
            3,
            &[
                0.040, 0.012, 0.006, //
                0.012, 0.050, 0.010, //
                0.006, 0.010, 0.030,
            ],
        )
    }

    #[test]
    fn projection_lands_on_bounded_simplex() {
        let set = BoundedSimplex::new(3, 0.1, 0.5).unwrap();
        let projected = set.project(&DVector::from_vec(vec![2.0, -1.0, 0.3]));
        assert!((projected.sum() - 1.0).abs() < 1e-9);
        assert!(projected.iter().all(|w| *w >= 0.1 - 1e-12 && *w <= 0.5 + 1e-12));
        assert!((projected[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn infeasible_bounds_are_rejected() {
        assert!(matches!(
            BoundedSimplex::new(3, 0.5, 1.0),
            Err(SolverError::Infeasible(_))
        ));
        assert!(matches!(
            BoundedSimplex::new(10, 0.0, 0.05),
            Err(SolverError::Infeasible(_))
        ));
    }

    #[test]
    fn minimizes_distance_to_interior_point() {
        let objective = Quadratic {
            target: DVector::from_vec(vec![0.2, 0.3, 0.5]),
        };
        let set = BoundedSimplex::new(3, 0.0, 1.0).unwrap();
        let start = DVector::from_element(3, 1.0 / 3.0);
        let solution = minimize(
            &objective,
            &set,
            &start,
            &SolverSettings::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert!((solution[0] - 0.2).abs() < 1e-6);
        assert!((solution[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn cancelled_solve_reports_timeout() {
        let objective = Quadratic {
            target: DVector::from_vec(vec![0.2, 0.8]),
        };
        let set = BoundedSimplex::new(2, 0.0, 1.0).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let start = DVector::from_vec(vec![0.5, 0.5]);
        let result = minimize(&objective, &set, &start, &SolverSettings::default(), &cancel);
        assert!(matches!(result, Err(SolverError::Timeout(_))));
    }

    #[test]
    fn variance_qp_matches_closed_form_interior_optimum() {
        let covariance = correlated_covariance();
        let solution = minimize_variance(
            &covariance,
            &[LinearConstraint::budget(3)],
            &SolverSettings::default(),
        )
        .unwrap();

        let inverse_ones = covariance.clone().try_inverse().unwrap() * DVector::from_element(3, 1.0);
        let expected = &inverse_ones / inverse_ones.sum();
        assert!(expected.iter().all(|w| *w > 0.05));
        for i in 0..3 {
            assert!((solution[i] - expected[i]).abs() < 1e-5, "{} vs {}", solution, expected);
        }
    }

    #[test]
    fn variance_qp_honours_return_floor() {
        let covariance = correlated_covariance();
        let mu = DVector::from_vec(vec![0.05, 0.12, 0.04]);
        let floor = 0.09;
        let constraints = [
            LinearConstraint::budget(3),
            LinearConstraint::AtLeast(mu.clone(), floor),
        ];
        let solution = minimize_variance(&covariance, &constraints, &SolverSettings::default()).unwrap();
        assert!((solution.sum() - 1.0).abs() < 1e-6);
        assert!(mu.dot(&solution) >= floor - 1e-6);
        assert!(solution.iter().all(|w| *w >= -1e-7));

        let unreachable = [
            LinearConstraint::budget(3),
            LinearConstraint::AtLeast(mu, 0.5),
        ];
        assert!(minimize_variance(&covariance, &unreachable, &SolverSettings::default()).is_err());
    }

    #[test]
    fn detects_singular_covariance() {
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, -1.0, -1.0, 1.0]);
        assert_eq!(
            ensure_positive_definite(&singular),
            Err(SolverError::NotPositiveDefinite)
        );
        let good = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        assert!(ensure_positive_definite(&good).is_ok());
    }

    #[test]
    fn timeout_wrapper_returns_job_result_or_times_out() {
        let value = run_with_timeout(Duration::from_secs(5), |_| Ok(42)).unwrap();
        assert_eq!(value, 42);

        let timed_out = run_with_timeout(Duration::from_millis(20), |cancel| {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(0)
        });
        assert!(matches!(timed_out, Err(SolverError::Timeout(_))));

        let no_budget = run_with_timeout(Duration::ZERO, |_| Ok(1));
        assert!(matches!(no_budget, Err(SolverError::Timeout(_))));
    }
}
