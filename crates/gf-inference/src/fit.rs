//! Joint fit of several datasets.
//!
//! The statistics of all datasets are summed into one objective over the
//! union of their free parameters. Parameters shared by handle appear once.
//! The optimizer works on factors (`value / scale`) after autoscaling.

use crate::optimizer::{
    ObjectiveFunction, OptimizationResult, OptimizerConfig, bounded_gradient, minimize,
};
use gf_core::{Covariance, Error, FitResult, Parameter, Parameters, Result, StatDataset};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::erf::erf;
use std::path::Path;

/// Settings of the profile-likelihood interval search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Step doublings allowed while bracketing the crossing
    pub max_steps: usize,
    /// Bisection iterations once bracketed
    pub max_iter: usize,
    /// Bracket width, relative to the initial step, at which the search stops
    pub tol: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self { max_steps: 20, max_iter: 50, tol: 1e-3 }
    }
}

/// Fit driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Optimizer backend and tolerances
    pub optimizer: OptimizerConfig,
    /// Estimate the covariance after minimization
    pub covariance: bool,
    /// Interval search settings
    pub confidence: ConfidenceConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            covariance: true,
            confidence: ConfidenceConfig::default(),
        }
    }
}

impl FitConfig {
    /// Parse YAML
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(s)?)
    }

    /// Read a `.yaml`/`.yml` or JSON file, chosen by extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml_ng::from_slice(&bytes)?),
            _ => Ok(serde_json::from_slice(&bytes)?),
        }
    }
}

/// Asymmetric profile-likelihood errors
#[derive(Debug, Clone)]
pub struct ConfidenceResult {
    /// Distance from the best fit to the upper crossing
    pub errp: f64,
    /// Distance from the best fit to the lower crossing
    pub errn: f64,
    /// Both crossings found
    pub success: bool,
    /// Failure description, empty on success
    pub message: String,
}

/// Total statistic along a parameter scan
#[derive(Debug, Clone)]
pub struct StatProfile {
    /// Scanned values
    pub values: Vec<f64>,
    /// Total statistic at each value
    pub stat: Vec<f64>,
    /// Whether the re-optimization converged at each value
    pub converged: Vec<bool>,
}

/// All parameters of the datasets, shared handles once
pub fn all_parameters(datasets: &[&dyn StatDataset]) -> Parameters {
    let mut all = Parameters::default();
    for d in datasets {
        all.extend(&d.parameters());
    }
    all
}

/// Non-frozen parameters of the datasets
pub fn free_parameters(datasets: &[&dyn StatDataset]) -> Parameters {
    all_parameters(datasets).free()
}

/// Sum of the dataset statistics at the current parameter values
pub fn total_stat(datasets: &[&dyn StatDataset]) -> Result<f64> {
    let mut total = 0.0;
    for d in datasets {
        let stat = d.stat_sum()?;
        if !stat.is_finite() {
            log::debug!("dataset '{}' returned a non-finite statistic", d.name());
        }
        total += stat;
    }
    Ok(total)
}

/// Summed statistic as a function of the factors of `parameters`
struct TotalStat<'a> {
    datasets: &'a [&'a dyn StatDataset],
    parameters: &'a Parameters,
    bounds: Vec<(f64, f64)>,
}

impl<'a> TotalStat<'a> {
    fn new(datasets: &'a [&'a dyn StatDataset], parameters: &'a Parameters) -> Self {
        Self { datasets, parameters, bounds: parameters.factor_bounds() }
    }
}

impl ObjectiveFunction for TotalStat<'_> {
    fn eval(&self, factors: &[f64]) -> Result<f64> {
        self.parameters.set_factors(factors)?;
        total_stat(self.datasets)
    }

    fn gradient(&self, factors: &[f64]) -> Result<Vec<f64>> {
        let g = bounded_gradient(self, factors, &self.bounds, 1e-6);
        self.parameters.set_factors(factors)?;
        g
    }
}

/// Finite-difference offsets `(plus, minus)` around `x` that stay inside `(lo, hi)`
fn stencil(x: f64, h: f64, (lo, hi): (f64, f64)) -> (f64, f64) {
    if x + h > hi && x - 2.0 * h >= lo {
        (0.0, -h)
    } else if x - h < lo && x + 2.0 * h <= hi {
        (h, 0.0)
    } else {
        (h, -h)
    }
}

/// Second derivatives by finite differences of the objective.
///
/// Central differences inside the bounds; a parameter at a bound gets a
/// one-sided stencil so the objective is never evaluated outside its domain.
fn compute_hessian(
    objective: &dyn ObjectiveFunction,
    x0: &[f64],
    bounds: &[(f64, f64)],
) -> Result<DMatrix<f64>> {
    let n = x0.len();
    let f0 = objective.eval(x0)?;
    let offsets: Vec<(f64, f64)> = x0
        .iter()
        .zip(bounds)
        .map(|(&x, &b)| stencil(x, 1e-3 * x.abs().max(1.0), b))
        .collect();
    let mut x = x0.to_vec();
    let mut hessian = DMatrix::zeros(n, n);

    for i in 0..n {
        let (p, m) = offsets[i];
        let mut at = |d: f64| -> Result<f64> {
            x[i] = x0[i] + d;
            let f = objective.eval(&x);
            x[i] = x0[i];
            f
        };
        hessian[(i, i)] = if m == 0.0 {
            (at(2.0 * p)? - 2.0 * at(p)? + f0) / (p * p)
        } else if p == 0.0 {
            (at(2.0 * m)? - 2.0 * at(m)? + f0) / (m * m)
        } else {
            (at(p)? - 2.0 * f0 + at(m)?) / (p * p)
        };

        for j in 0..i {
            let (pj, mj) = offsets[j];
            let mut corner = |di: f64, dj: f64| -> Result<f64> {
                x[i] = x0[i] + di;
                x[j] = x0[j] + dj;
                let f = objective.eval(&x);
                x[i] = x0[i];
                x[j] = x0[j];
                f
            };
            let v = (corner(p, pj)? - corner(p, mj)? - corner(m, pj)? + corner(m, mj)?)
                / ((p - m) * (pj - mj));
            hessian[(i, j)] = v;
            hessian[(j, i)] = v;
        }
    }
    Ok(hessian)
}

/// Damped Cholesky inverse, LU as last resort; `None` without a usable inverse
fn invert_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = hessian.nrows();
    let identity = DMatrix::identity(n, n);
    let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut h_damped = hessian.clone();
    let mut damping = 0.0_f64;
    let max_attempts = 10;
    for attempt in 0..max_attempts {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(h_damped.clone()) {
            if damping > 0.0 {
                log::debug!("Hessian needed diagonal damping {damping:.3e}");
            }
            return Some(chol.solve(&identity));
        }
        if attempt + 1 == max_attempts {
            break;
        }
        let next = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
        for i in 0..n {
            h_damped[(i, i)] += next - damping;
        }
        damping = next;
    }

    let inv = h_damped.lu().try_inverse()?;
    (0..n).all(|i| inv[(i, i)].is_finite() && inv[(i, i)] > 0.0).then_some(inv)
}

/// Chi-square threshold of one degree of freedom for a `sigma` interval
pub fn stat_threshold(sigma: f64) -> Result<f64> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(Error::Validation(format!("sigma must be > 0, got {sigma}")));
    }
    let chi2 = ChiSquared::new(1.0).map_err(|e| Error::Computation(e.to_string()))?;
    Ok(chi2.inverse_cdf(erf(sigma / std::f64::consts::SQRT_2)))
}

/// Errors and optional covariance in physical units
struct CovarianceEstimate {
    errors: Vec<f64>,
    matrix: Option<Vec<f64>>,
}

/// Minimizes the summed statistic of a set of datasets
#[derive(Debug, Clone, Default)]
pub struct Fit {
    config: FitConfig,
}

impl Fit {
    /// Driver with the given settings
    pub fn new(config: FitConfig) -> Self {
        Self { config }
    }

    /// Current settings
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Minimize, then estimate the covariance if enabled.
    ///
    /// Best-fit values stay in the parameters; errors are written back when a
    /// covariance was estimated. Non-convergence is reported in the result,
    /// not as an error.
    pub fn run(&self, datasets: &[&dyn StatDataset]) -> Result<FitResult> {
        if datasets.is_empty() {
            return Err(Error::Validation("no datasets to fit".to_string()));
        }
        let (params, opt) = self.optimize_free(datasets)?;
        let n = params.len();

        let estimate = if self.config.covariance && n > 0 {
            let estimate = self.estimate_covariance(datasets, &params)?;
            for (p, &e) in params.iter().zip(&estimate.errors) {
                p.set_error(e);
            }
            estimate
        } else {
            CovarianceEstimate { errors: vec![0.0; n], matrix: None }
        };

        let stat = total_stat(datasets)?;
        log::debug!(
            "fit of {} dataset(s), {} free parameter(s): stat={stat:.4} after {} iterations",
            datasets.len(),
            n,
            opt.n_iter
        );
        let mut result = FitResult::new(
            params.names(),
            params.values(),
            estimate.errors,
            stat,
            opt.converged,
            opt.message,
        )
        .with_counts(self.config.optimizer.backend.name(), opt.n_iter as usize, opt.n_fev);
        if let Some(matrix) = estimate.matrix {
            result = result.with_covariance(matrix);
        }
        Ok(result)
    }

    /// Minimize over the free parameters without the covariance step
    pub fn optimize(&self, datasets: &[&dyn StatDataset]) -> Result<OptimizationResult> {
        self.optimize_free(datasets).map(|(_, opt)| opt)
    }

    fn optimize_free(
        &self,
        datasets: &[&dyn StatDataset],
    ) -> Result<(Parameters, OptimizationResult)> {
        let params = free_parameters(datasets);
        params.autoscale();
        let objective = TotalStat::new(datasets, &params);
        let init = params.factors();
        let bounds = params.factor_bounds();
        let opt = minimize(&self.config.optimizer, &objective, &init, &bounds)?;
        params.set_factors(&opt.parameters)?;
        if !opt.converged {
            log::warn!("fit did not converge: {}", opt.message);
        }
        Ok((params, opt))
    }

    /// Covariance `2 H⁻¹` at the current values over the free parameters.
    ///
    /// Writes the errors back into the parameters. `None` when the Hessian
    /// cannot be inverted; the errors then come from its diagonal.
    pub fn covariance(&self, datasets: &[&dyn StatDataset]) -> Result<Option<Covariance>> {
        let params = free_parameters(datasets);
        if params.is_empty() {
            return Ok(Some(Covariance::zeros(params)));
        }
        let estimate = self.estimate_covariance(datasets, &params)?;
        for (p, &e) in params.iter().zip(&estimate.errors) {
            p.set_error(e);
        }
        estimate.matrix.map(|m| Covariance::from_row_major(params, m)).transpose()
    }

    fn estimate_covariance(
        &self,
        datasets: &[&dyn StatDataset],
        params: &Parameters,
    ) -> Result<CovarianceEstimate> {
        let n = params.len();
        let objective = TotalStat::new(datasets, params);
        let x0 = params.factors();
        let hessian = compute_hessian(&objective, &x0, &objective.bounds);
        params.set_factors(&x0)?;
        let hessian = hessian?;
        let scales = params.scales();

        let Some(inv) = invert_hessian(&hessian) else {
            log::warn!("Hessian inversion failed, using diagonal approximation");
            let errors = (0..n)
                .map(|i| (2.0 / hessian[(i, i)].abs().max(1e-12)).sqrt() * scales[i].abs())
                .collect();
            return Ok(CovarianceEstimate { errors, matrix: None });
        };

        let mut matrix = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                matrix[i * n + j] = (inv[(i, j)] + inv[(j, i)]) * (scales[i] * scales[j]);
            }
        }
        let errors: Vec<f64> = (0..n).map(|i| matrix[i * n + i].max(0.0).sqrt()).collect();
        if (0..n).any(|i| !(matrix[i * n + i].is_finite() && matrix[i * n + i] > 0.0)) {
            log::warn!("Invalid covariance diagonal; omitting covariance matrix");
            return Ok(CovarianceEstimate { errors, matrix: None });
        }
        Ok(CovarianceEstimate { errors, matrix: Some(matrix) })
    }

    /// Statistic with `parameter` fixed at `value`, the other free parameters
    /// re-optimized. Leaves the parameters at the conditional minimum.
    fn profile_point(
        &self,
        datasets: &[&dyn StatDataset],
        parameter: &Parameter,
        value: f64,
    ) -> Result<(f64, bool)> {
        let was_frozen = parameter.is_frozen();
        parameter.set_frozen(true);
        parameter.set_value(value);
        let opt = self.optimize_free(datasets);
        parameter.set_frozen(was_frozen);
        let (_, opt) = opt?;
        Ok((total_stat(datasets)?, opt.converged))
    }

    /// Profile-likelihood interval of `parameter` at `sigma` standard deviations.
    ///
    /// Starts from the current values, which should be the best fit. All
    /// parameters are restored afterwards.
    pub fn confidence(
        &self,
        datasets: &[&dyn StatDataset],
        parameter: &Parameter,
        sigma: f64,
    ) -> Result<ConfidenceResult> {
        let delta = stat_threshold(sigma)?;
        if !free_parameters(datasets).contains(parameter) {
            return Err(Error::Validation(format!(
                "parameter '{}' is not a free parameter of the fit",
                parameter.name()
            )));
        }
        let all = all_parameters(datasets);
        let states = all.states();
        let v0 = parameter.value();
        let f0 = total_stat(datasets)?;
        let target = f0 + delta;
        let step = if parameter.error() > 0.0 {
            sigma * parameter.error()
        } else {
            0.1 * parameter.scale().abs()
        };

        let upper = self.find_crossing(datasets, parameter, (v0, f0), step, target);
        all.restore(&states)?;
        let lower = self.find_crossing(datasets, parameter, (v0, f0), -step, target);
        all.restore(&states)?;

        let mut messages = Vec::new();
        let errp = upper?.map_or_else(
            |m| {
                messages.push(format!("upper: {m}"));
                f64::NAN
            },
            |v| v - v0,
        );
        let errn = lower?.map_or_else(
            |m| {
                messages.push(format!("lower: {m}"));
                f64::NAN
            },
            |v| v0 - v,
        );
        if !messages.is_empty() {
            log::warn!("confidence of '{}': {}", parameter.name(), messages.join("; "));
        }
        Ok(ConfidenceResult {
            errp,
            errn,
            success: messages.is_empty(),
            message: messages.join("; "),
        })
    }

    /// Value where the profiled statistic reaches `target` walking from the
    /// best fit `(v0, f0)` in the direction of `step`. The inner `Err` names
    /// why no crossing was found.
    fn find_crossing(
        &self,
        datasets: &[&dyn StatDataset],
        parameter: &Parameter,
        (v0, f0): (f64, f64),
        step: f64,
        target: f64,
    ) -> Result<std::result::Result<f64, String>> {
        let cfg = &self.config.confidence;
        let limit = if step > 0.0 { parameter.max() } else { parameter.min() };
        let beyond = |v: f64| if step > 0.0 { v >= limit } else { v <= limit };

        let (mut lo, mut f_lo) = (v0, f0);
        let mut width = step;
        let mut bracket = None;
        for _ in 0..cfg.max_steps {
            let mut hi = v0 + width;
            let at_limit = beyond(hi);
            if at_limit {
                hi = limit;
            }
            let (f_hi, _) = self.profile_point(datasets, parameter, hi)?;
            if f_hi >= target {
                bracket = Some((hi, f_hi));
                break;
            }
            if at_limit {
                return Ok(Err(format!("no crossing before the bound {limit}")));
            }
            (lo, f_lo) = (hi, f_hi);
            width *= 2.0;
        }
        let Some((mut hi, mut f_hi)) = bracket else {
            return Ok(Err(format!("no crossing within {} steps", cfg.max_steps)));
        };

        let min_width = cfg.tol * step.abs();
        for _ in 0..cfg.max_iter {
            if (hi - lo).abs() <= min_width {
                break;
            }
            let mid = 0.5 * (lo + hi);
            let (f_mid, _) = self.profile_point(datasets, parameter, mid)?;
            if f_mid >= target {
                (hi, f_hi) = (mid, f_mid);
            } else {
                (lo, f_lo) = (mid, f_mid);
            }
        }
        let t = if f_hi > f_lo { ((target - f_lo) / (f_hi - f_lo)).clamp(0.0, 1.0) } else { 0.5 };
        Ok(Ok(lo + t * (hi - lo)))
    }

    /// Total statistic at each of `values` of `parameter`.
    ///
    /// With `reoptimize` the other free parameters are fitted at every point.
    /// All parameters are restored afterwards.
    pub fn stat_profile(
        &self,
        datasets: &[&dyn StatDataset],
        parameter: &Parameter,
        values: &[f64],
        reoptimize: bool,
    ) -> Result<StatProfile> {
        let all = all_parameters(datasets);
        if !all.contains(parameter) {
            return Err(Error::Validation(format!(
                "parameter '{}' is not used by the datasets",
                parameter.name()
            )));
        }
        let states = all.states();
        let mut stat = Vec::with_capacity(values.len());
        let mut converged = Vec::with_capacity(values.len());
        let scan = values.iter().try_for_each(|&v| {
            let (s, c) = if reoptimize {
                self.profile_point(datasets, parameter, v)?
            } else {
                parameter.set_value(v);
                (total_stat(datasets)?, true)
            };
            stat.push(s);
            converged.push(c);
            Ok::<_, Error>(())
        });
        all.restore(&states)?;
        scan?;
        Ok(StatProfile { values: values.to_vec(), stat, converged })
    }
}
