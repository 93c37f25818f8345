//! Common data types for gammafold

use serde::{Deserialize, Serialize};

/// Fit result containing parameter estimates and uncertainties
///
/// Values are reported for the free parameters only, in the order in which
/// the fit driver assembled them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Names of the free parameters
    pub parameter_names: Vec<String>,

    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal)
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if Hessian inversion failed
    /// or the covariance step was disabled.
    pub covariance: Option<Vec<f64>>,

    /// Total fit statistic (summed Cash/WSTAT) at the minimum
    pub total_stat: f64,

    /// Convergence status
    pub converged: bool,

    /// Optimizer termination message
    pub message: String,

    /// Name of the optimizer backend
    pub backend: String,

    /// Number of optimizer iterations
    pub n_iter: usize,

    /// Number of objective evaluations
    pub n_fev: usize,
}

impl FitResult {
    /// Create a new fit result without covariance
    pub fn new(
        parameter_names: Vec<String>,
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        total_stat: f64,
        converged: bool,
        message: String,
    ) -> Self {
        Self {
            parameter_names,
            parameters,
            uncertainties,
            covariance: None,
            total_stat,
            converged,
            message,
            backend: String::new(),
            n_iter: 0,
            n_fev: 0,
        }
    }

    /// Attach a row-major covariance matrix
    pub fn with_covariance(mut self, covariance: Vec<f64>) -> Self {
        self.covariance = Some(covariance);
        self
    }

    /// Attach optimizer bookkeeping
    pub fn with_counts(mut self, backend: &str, n_iter: usize, n_fev: usize) -> Self {
        self.backend = backend.to_string();
        self.n_iter = n_iter;
        self.n_fev = n_fev;
        self
    }

    /// Best-fit value of a named parameter
    pub fn value(&self, name: &str) -> Option<f64> {
        let i = self.parameter_names.iter().position(|n| n == name)?;
        self.parameters.get(i).copied()
    }

    /// Uncertainty of a named parameter
    pub fn uncertainty(&self, name: &str) -> Option<f64> {
        let i = self.parameter_names.iter().position(|n| n == name)?;
        self.uncertainties.get(i).copied()
    }

    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(cov[i * n + j] / (sigma_i * sigma_j))
    }
}
