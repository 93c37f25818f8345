//! Optimizer backends
//!
//! Thin wrappers around argmin solvers behind one interface. Every backend
//! minimizes an [`ObjectiveFunction`] inside a box; parameters are clamped to
//! the box before each evaluation.

use argmin::core::{
    CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use gf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Minimization algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerBackend {
    /// Quasi-Newton with More-Thuente line search
    #[default]
    Lbfgs,
    /// Derivative-free simplex search
    NelderMead,
}

impl OptimizerBackend {
    /// Short name reported in fit results
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerBackend::Lbfgs => "lbfgs",
            OptimizerBackend::NelderMead => "nelder-mead",
        }
    }
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Algorithm
    pub backend: OptimizerBackend,
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Gradient-norm tolerance (L-BFGS) or simplex spread tolerance (Nelder-Mead).
    /// Restarts stop once the objective decreases by less than `0.1 * tol * max(|f|, 1)`.
    pub tol: f64,
    /// Number of corrections kept by L-BFGS
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { backend: OptimizerBackend::Lbfgs, max_iter: 1000, tol: 1e-6, m: 10 }
    }
}

/// Result of one minimization
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best parameters, inside the bounds
    pub parameters: Vec<f64>,
    /// Objective at `parameters`
    pub fval: f64,
    /// Iterations
    pub n_iter: u64,
    /// Objective evaluations
    pub n_fev: usize,
    /// Gradient evaluations
    pub n_gev: usize,
    /// Terminated by a convergence criterion
    pub converged: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, n_gev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged
        )
    }
}

/// Function to minimize
pub trait ObjectiveFunction: Send + Sync {
    /// Value at `params`
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at `params`; central differences unless overridden
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        central_gradient(self, params, 1e-8)
    }
}

/// Central-difference gradient with step `rel * max(|x_i|, 1)`
pub fn central_gradient<F: ObjectiveFunction + ?Sized>(
    objective: &F,
    params: &[f64],
    rel: f64,
) -> Result<Vec<f64>> {
    let unbounded = vec![(f64::NEG_INFINITY, f64::INFINITY); params.len()];
    bounded_gradient(objective, params, &unbounded, rel)
}

/// Finite-difference gradient that never evaluates outside `bounds`.
///
/// Central differences inside the box, one-sided differences where a step of
/// `rel * max(|x_i|, 1)` would cross a bound.
pub fn bounded_gradient<F: ObjectiveFunction + ?Sized>(
    objective: &F,
    params: &[f64],
    bounds: &[(f64, f64)],
    rel: f64,
) -> Result<Vec<f64>> {
    let mut grad = vec![0.0; params.len()];
    let mut x = params.to_vec();
    for (i, &(lo, hi)) in bounds.iter().enumerate().take(params.len()) {
        let eps = rel * params[i].abs().max(1.0);
        let up = (params[i] + eps).min(hi).max(params[i]);
        let down = (params[i] - eps).max(lo).min(params[i]);
        if up <= down {
            continue;
        }
        x[i] = up;
        let f_plus = objective.eval(&x)?;
        x[i] = down;
        let f_minus = objective.eval(&x)?;
        x[i] = params[i];
        grad[i] = (f_plus - f_minus) / (up - down);
    }
    Ok(grad)
}

/// Euclidean norm of the gradient without the components pushing out of the box
pub fn projected_gradient_norm(
    objective: &dyn ObjectiveFunction,
    params: &[f64],
    bounds: &[(f64, f64)],
) -> Result<f64> {
    const EPS: f64 = 1e-12;
    let g = objective.gradient(params)?;
    let mut sum = 0.0;
    for (gi, (&x, &(lo, hi))) in g.iter().zip(params.iter().zip(bounds)) {
        let outward = (x <= lo + EPS && *gi > 0.0) || (x >= hi - EPS && *gi < 0.0);
        if !outward {
            sum += gi * gi;
        }
    }
    Ok(sum.sqrt())
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

fn check_bounds(init: &[f64], bounds: &[(f64, f64)]) -> Result<()> {
    if init.len() != bounds.len() {
        return Err(Error::Validation(format!(
            "Parameter and bounds length mismatch: {} != {}",
            init.len(),
            bounds.len()
        )));
    }
    if let Some((i, (lo, hi))) = bounds.iter().enumerate().find(|(_, (lo, hi))| !(lo <= hi)) {
        return Err(Error::Validation(format!("bounds of parameter {i} are empty: [{lo}, {hi}]")));
    }
    Ok(())
}

/// Required decrease of the objective between restarts, relative to `|f|`
fn cost_tolerance(tol: f64, f: f64) -> f64 {
    if tol == 0.0 { 0.0 } else { (0.1 * tol * f.abs().max(1.0)).max(1e-12) }
}

/// Upper limit on solver restarts within one minimization
const MAX_RESTARTS: usize = 10;

/// Weight of the quadratic penalty outside the bounds
const BOUND_PENALTY: f64 = 1e6;

#[derive(Default)]
struct FuncCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

/// Objective seen by argmin: evaluated at the clamped point, plus a quadratic
/// penalty on the distance outside the box so the surface is not flat there.
/// NaN is reported as `+inf`.
#[derive(Clone)]
struct ArgminProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    counts: Arc<FuncCounts>,
}

fn to_argmin(e: Error) -> argmin::core::Error {
    argmin::core::Error::msg(e.to_string())
}

impl CostFunction for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<f64, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let f = nan_to_inf(self.objective.eval(&clamped).map_err(to_argmin)?);
        let outside: f64 = params.iter().zip(&clamped).map(|(x, c)| (x - c) * (x - c)).sum();
        Ok(f + BOUND_PENALTY * outside)
    }
}

impl Gradient for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let mut g = self.objective.gradient(&clamped).map_err(to_argmin)?;
        for (gi, (x, c)) in g.iter_mut().zip(params.iter().zip(&clamped)) {
            *gi += 2.0 * BOUND_PENALTY * (x - c);
        }
        Ok(g)
    }
}

fn nan_to_inf(f: f64) -> f64 {
    if f.is_nan() { f64::INFINITY } else { f }
}

fn is_converged(status: &TerminationStatus) -> bool {
    matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    )
}

/// Outcome of a single solver run, at a point inside the bounds
struct Run {
    parameters: Vec<f64>,
    fval: f64,
    n_iter: u64,
    converged: bool,
    message: String,
}

impl Run {
    fn from_state(
        best: Option<&Vec<f64>>,
        n_iter: u64,
        status: &TerminationStatus,
        problem: &ArgminProblem<'_>,
    ) -> Result<Self> {
        let best = best.ok_or_else(|| Error::Computation("No best parameters found".to_string()))?;
        let parameters = clamp_params(best, problem.bounds);
        problem.counts.cost.fetch_add(1, Ordering::Relaxed);
        let fval = nan_to_inf(problem.objective.eval(&parameters)?);
        Ok(Self {
            parameters,
            fval,
            n_iter,
            converged: is_converged(status),
            message: status.to_string(),
        })
    }
}

/// Progress of a minimization across restarts
struct Progress<'a> {
    problem: ArgminProblem<'a>,
    parameters: Vec<f64>,
    fval: f64,
    f_start: f64,
    n_iter: u64,
}

impl<'a> Progress<'a> {
    fn start(
        objective: &'a dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &'a [(f64, f64)],
    ) -> Result<Self> {
        check_bounds(init_params, bounds)?;
        let parameters = clamp_params(init_params, bounds);
        let problem = ArgminProblem { objective, bounds, counts: Arc::new(FuncCounts::default()) };
        problem.counts.cost.fetch_add(1, Ordering::Relaxed);
        let fval = nan_to_inf(objective.eval(&parameters)?);
        Ok(Self { problem, parameters, f_start: fval, fval, n_iter: 0 })
    }

    fn remaining(&self, max_iter: u64) -> u64 {
        max_iter.saturating_sub(self.n_iter)
    }

    /// Take the result of a run if it is better; returns the decrease achieved
    fn accept(&mut self, run: &Run) -> f64 {
        self.n_iter += run.n_iter;
        let decrease = self.fval - run.fval;
        if decrease > 0.0 {
            self.parameters = run.parameters.clone();
            self.fval = run.fval;
        }
        decrease.max(0.0)
    }

    fn moved(&self, tol: f64) -> bool {
        self.f_start - self.fval > cost_tolerance(tol, self.f_start)
    }

    fn finish(self, converged: bool, message: impl Into<String>) -> OptimizationResult {
        OptimizationResult {
            parameters: self.parameters,
            fval: self.fval,
            n_iter: self.n_iter,
            n_fev: self.problem.counts.cost.load(Ordering::Relaxed),
            n_gev: self.problem.counts.grad.load(Ordering::Relaxed),
            converged,
            message: message.into(),
        }
    }
}

/// L-BFGS with box constraints.
///
/// Each run restarts from the best point with a fresh curvature memory while
/// the objective keeps decreasing. A run that stops without progress while
/// the projected gradient is still large hands over to one Nelder-Mead pass.
pub struct LbfgsbOptimizer {
    config: OptimizerConfig,
}

impl LbfgsbOptimizer {
    /// Optimizer with the given settings; `config.backend` is ignored
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    fn run(&self, progress: &Progress<'_>, max_iters: u64) -> Result<Run> {
        let tol_cost = cost_tolerance(self.config.tol, progress.fval);
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.config.m)
            .with_tolerance_grad(self.config.tol)
            .map_err(|e| Error::Validation(format!("Invalid optimizer configuration (tol): {e}")))?
            .with_tolerance_cost(tol_cost)
            .map_err(|e| {
                Error::Validation(format!("Invalid optimizer configuration (tol_cost): {e}"))
            })?;

        let problem = progress.problem.clone();
        let init = progress.parameters.clone();
        match Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(max_iters))
            .run()
        {
            Ok(res) => {
                let state = res.state();
                Run::from_state(
                    state.get_best_param(),
                    state.get_iter(),
                    state.get_termination_status(),
                    &progress.problem,
                )
            }
            Err(e) => {
                log::debug!("L-BFGS run failed: {e}");
                Ok(Run {
                    parameters: progress.parameters.clone(),
                    fval: progress.fval,
                    n_iter: 0,
                    converged: false,
                    message: format!("line search failed: {e}"),
                })
            }
        }
    }

    /// Minimize `objective` from `init_params` within `bounds`
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        let tol = self.config.tol;
        let mut progress = Progress::start(objective, init_params, bounds)?;
        let mut simplex_tried = false;

        for _ in 0..MAX_RESTARTS {
            let remaining = progress.remaining(self.config.max_iter);
            if remaining == 0 {
                return Ok(progress.finish(false, "Maximum number of iterations reached"));
            }
            let run = self.run(&progress, remaining)?;
            let decrease = progress.accept(&run);
            let gnorm = projected_gradient_norm(objective, &progress.parameters, bounds)?;
            if run.converged && gnorm <= tol {
                return Ok(progress.finish(true, run.message));
            }
            if decrease > cost_tolerance(tol, progress.fval) {
                continue;
            }
            if !run.converged && run.n_iter > 0 {
                return Ok(progress.finish(false, run.message));
            }
            if simplex_tried {
                // neither solver lowers the objective any further
                let converged = progress.moved(tol) || gnorm <= tol.max(1e-3);
                let message = if converged {
                    format!("Solver converged (projected gradient norm {gnorm:.3e})")
                } else {
                    format!("no progress from the starting point, gradient norm {gnorm:.3e}")
                };
                return Ok(progress.finish(converged, message));
            }
            let remaining = progress.remaining(self.config.max_iter);
            if remaining == 0 {
                return Ok(progress.finish(false, "Maximum number of iterations reached"));
            }
            log::debug!("L-BFGS stalled at gradient norm {gnorm:.3e}, trying Nelder-Mead");
            simplex_tried = true;
            let run = NelderMeadOptimizer::new(self.config.clone()).run(&progress, remaining)?;
            progress.accept(&run);
        }
        Ok(progress.finish(false, format!("no stable minimum after {MAX_RESTARTS} restarts")))
    }
}

impl Default for LbfgsbOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

/// Nelder-Mead simplex search inside the bounds.
///
/// The spread of vertex values can vanish on a simplex straddling the
/// minimum, so the search restarts with a fresh simplex until a restart no
/// longer lowers the objective.
pub struct NelderMeadOptimizer {
    config: OptimizerConfig,
}

impl NelderMeadOptimizer {
    /// Optimizer with the given settings; `m` and `backend` are ignored
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Start vertex plus one vertex per axis, stepped inward when a bound is close.
    ///
    /// Steps are `0.1 * max(|x|, 1)` in the scaled parameters, at most a
    /// quarter of a finite bound interval.
    fn initial_simplex(init: &[f64], bounds: &[(f64, f64)]) -> Vec<Vec<f64>> {
        let mut simplex = vec![init.to_vec()];
        for (i, (&x, &(lo, hi))) in init.iter().zip(bounds).enumerate() {
            let mut step = 0.1 * x.abs().max(1.0);
            if (hi - lo).is_finite() && hi > lo {
                step = step.min(0.25 * (hi - lo));
            }
            let mut v = init.to_vec();
            v[i] = if x + step <= hi { x + step } else { (x - step).max(lo) };
            simplex.push(v);
        }
        simplex
    }

    fn run(&self, progress: &Progress<'_>, max_iters: u64) -> Result<Run> {
        let simplex = Self::initial_simplex(&progress.parameters, progress.problem.bounds);
        let solver = NelderMead::new(simplex)
            .with_sd_tolerance(self.config.tol)
            .map_err(|e| Error::Validation(format!("Invalid optimizer configuration (tol): {e}")))?;

        let res = Executor::new(progress.problem.clone(), solver)
            .configure(|state| state.max_iters(max_iters))
            .run()
            .map_err(|e| Error::Computation(format!("Optimization failed: {e}")))?;

        let state = res.state();
        Run::from_state(
            state.get_best_param(),
            state.get_iter(),
            state.get_termination_status(),
            &progress.problem,
        )
    }

    /// Minimize `objective` from `init_params` within `bounds`
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        let mut progress = Progress::start(objective, init_params, bounds)?;
        for _ in 0..MAX_RESTARTS {
            let remaining = progress.remaining(self.config.max_iter);
            if remaining == 0 {
                return Ok(progress.finish(false, "Maximum number of iterations reached"));
            }
            let run = self.run(&progress, remaining)?;
            let decrease = progress.accept(&run);
            if !run.converged {
                return Ok(progress.finish(false, run.message));
            }
            if decrease <= cost_tolerance(self.config.tol, progress.fval) {
                return Ok(progress.finish(true, run.message));
            }
        }
        Ok(progress.finish(false, format!("no stable minimum after {MAX_RESTARTS} restarts")))
    }
}

/// Run the backend selected in `config`
pub fn minimize(
    config: &OptimizerConfig,
    objective: &dyn ObjectiveFunction,
    init_params: &[f64],
    bounds: &[(f64, f64)],
) -> Result<OptimizationResult> {
    if init_params.is_empty() {
        let fval = objective.eval(&[])?;
        return Ok(OptimizationResult {
            parameters: Vec::new(),
            fval,
            n_iter: 0,
            n_fev: 1,
            n_gev: 0,
            converged: true,
            message: "no free parameters".to_string(),
        });
    }
    match config.backend {
        OptimizerBackend::Lbfgs => {
            LbfgsbOptimizer::new(config.clone()).minimize(objective, init_params, bounds)
        }
        OptimizerBackend::NelderMead => {
            NelderMeadOptimizer::new(config.clone()).minimize(objective, init_params, bounds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // Poisson-like bowl: f(a, b) = sum over two bins of 2(mu - n ln mu), mu_i = a*x_i + b
    struct TwoBinCash;

    impl ObjectiveFunction for TwoBinCash {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            let bins = [(1.0, 30.0), (2.0, 50.0)];
            let mut total = 0.0;
            for (x, n) in bins {
                let mu = p[0] * x + p[1];
                if mu <= 0.0 {
                    return Ok(f64::INFINITY);
                }
                total += 2.0 * (mu - n * mu.ln());
            }
            Ok(total)
        }
    }

    // f(x, y) = (x - 2)^2 + (y - 3)^2
    struct Quadratic;

    impl ObjectiveFunction for Quadratic {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok((p[0] - 2.0).powi(2) + (p[1] - 3.0).powi(2))
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (p[0] - 2.0), 2.0 * (p[1] - 3.0)])
        }
    }

    struct Rosenbrock;

    impl ObjectiveFunction for Rosenbrock {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok((1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0] * p[0]).powi(2))
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            let (x, y) = (p[0], p[1]);
            Ok(vec![-2.0 * (1.0 - x) - 400.0 * x * (y - x * x), 200.0 * (y - x * x)])
        }
    }

    #[test]
    fn test_lbfgs_quadratic() {
        let config = OptimizerConfig { max_iter: 100, ..Default::default() };
        let res = LbfgsbOptimizer::new(config)
            .minimize(&Quadratic, &[0.0, 0.0], &[(-10.0, 10.0), (-10.0, 10.0)])
            .unwrap();
        assert!(res.converged, "{}", res.message);
        assert_relative_eq!(res.parameters[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(res.parameters[1], 3.0, epsilon = 1e-4);
        assert_relative_eq!(res.fval, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_lbfgs_respects_bounds() {
        let res = LbfgsbOptimizer::default()
            .minimize(&Quadratic, &[4.0, 1.5], &[(3.0, 5.0), (1.0, 2.0)])
            .unwrap();
        assert_relative_eq!(res.parameters[0], 3.0, epsilon = 1e-4);
        assert_relative_eq!(res.parameters[1], 2.0, epsilon = 1e-4);
        assert!(res.converged, "stopped at a bound without converging: {}", res.message);
    }

    #[test]
    fn test_lbfgs_rosenbrock() {
        let config = OptimizerConfig { max_iter: 2000, ..Default::default() };
        let res = LbfgsbOptimizer::new(config)
            .minimize(&Rosenbrock, &[-1.2, 1.0], &[(-5.0, 5.0), (-5.0, 5.0)])
            .unwrap();
        assert_relative_eq!(res.parameters[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(res.parameters[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_numerical_gradient_cash() {
        // minimum where both bins are predicted exactly: a = 20, b = 10
        let bounds = [(0.0, 100.0), (0.0, 100.0)];
        let res = LbfgsbOptimizer::default().minimize(&TwoBinCash, &[10.0, 5.0], &bounds).unwrap();
        assert_relative_eq!(res.parameters[0], 20.0, epsilon = 1e-3);
        assert_relative_eq!(res.parameters[1], 10.0, epsilon = 1e-3);
        assert!(res.n_gev > 0);
    }

    #[test]
    fn test_nelder_mead_cash() {
        let config = OptimizerConfig {
            backend: OptimizerBackend::NelderMead,
            max_iter: 5000,
            tol: 1e-10,
            ..Default::default()
        };
        let bounds = [(0.0, 100.0), (0.0, 100.0)];
        let res = minimize(&config, &TwoBinCash, &[10.0, 5.0], &bounds).unwrap();
        assert!(res.converged, "{}", res.message);
        assert_relative_eq!(res.parameters[0], 20.0, epsilon = 1e-2);
        assert_relative_eq!(res.parameters[1], 10.0, epsilon = 1e-2);
        assert_eq!(res.n_gev, 0);
    }

    #[test]
    fn test_nelder_mead_clamped_to_bounds() {
        let config = OptimizerConfig {
            backend: OptimizerBackend::NelderMead,
            tol: 1e-10,
            ..Default::default()
        };
        let res = minimize(&config, &Quadratic, &[4.0, 1.5], &[(3.0, 5.0), (1.0, 2.0)]).unwrap();
        assert_relative_eq!(res.parameters[0], 3.0, epsilon = 1e-3);
        assert_relative_eq!(res.parameters[1], 2.0, epsilon = 1e-3);
    }

    // Gaussian bowl in one parameter: ((x - mean) / sigma)^2
    struct Bowl {
        mean: f64,
        sigma: f64,
    }

    impl ObjectiveFunction for Bowl {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok(((p[0] - self.mean) / self.sigma).powi(2))
        }
    }

    #[test]
    fn test_lbfgs_minimum_next_to_bound() {
        // the first step overshoots the upper bound by far
        let res = LbfgsbOptimizer::default()
            .minimize(&Bowl { mean: 3.0, sigma: 0.5 }, &[1.0], &[(0.0, 3.2)])
            .unwrap();
        assert!(res.converged, "{}", res.message);
        assert_relative_eq!(res.parameters[0], 3.0, epsilon = 1e-4);
        assert!(res.fval < 1e-6);
    }

    #[test]
    fn test_nelder_mead_restarts_after_symmetric_stall() {
        // vertices at 4.1 and 4.3 have equal values around the minimum at 4.2
        let config = OptimizerConfig {
            backend: OptimizerBackend::NelderMead,
            tol: 1e-12,
            ..Default::default()
        };
        let bowl = Bowl { mean: 4.2, sigma: 0.3 };
        let res = minimize(&config, &bowl, &[1.0], &[(f64::NEG_INFINITY, f64::INFINITY)]).unwrap();
        assert!(res.converged, "{}", res.message);
        assert_relative_eq!(res.parameters[0], 4.2, epsilon = 1e-4);
    }

    #[test]
    fn test_max_iter_reported_as_not_converged() {
        let config = OptimizerConfig { max_iter: 2, ..Default::default() };
        let res = LbfgsbOptimizer::new(config)
            .minimize(&Rosenbrock, &[-1.2, 1.0], &[(-5.0, 5.0), (-5.0, 5.0)])
            .unwrap();
        assert!(!res.converged);
        assert!(res.n_iter <= 2);
    }

    #[test]
    fn test_gradient_one_sided_at_bounds() {
        // undefined below zero
        struct Root;
        impl ObjectiveFunction for Root {
            fn eval(&self, p: &[f64]) -> Result<f64> {
                Ok(if p[0] < 0.0 { f64::NAN } else { (p[0] + 1.0).powi(2) })
            }
        }
        let g = bounded_gradient(&Root, &[0.0], &[(0.0, f64::INFINITY)], 1e-6).unwrap();
        assert_relative_eq!(g[0], 2.0, epsilon = 1e-5);
        assert!(central_gradient(&Root, &[0.0], 1e-6).unwrap()[0].is_nan());
        let norm = projected_gradient_norm(&Quadratic, &[3.0, 2.0], &[(3.0, 5.0), (1.0, 2.0)]);
        assert_eq!(norm.unwrap(), 0.0);
    }

    #[test]
    fn test_invalid_bounds() {
        let err = LbfgsbOptimizer::default().minimize(&Quadratic, &[0.0], &[(0.0, 1.0), (0.0, 1.0)]);
        assert!(matches!(err, Err(Error::Validation(_))));
        let err = minimize(&OptimizerConfig::default(), &Quadratic, &[0.0, 0.0], &[
            (1.0, 0.0),
            (0.0, 1.0),
        ]);
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: OptimizerConfig =
            serde_yaml_ng::from_str("backend: nelder-mead\nmax_iter: 50\n").unwrap();
        assert_eq!(config.backend, OptimizerBackend::NelderMead);
        assert_eq!(config.max_iter, 50);
        assert_eq!(config.m, 10);
        assert_eq!(config.backend.name(), "nelder-mead");
    }
}
