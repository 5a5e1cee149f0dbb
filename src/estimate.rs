use crate::inference::report::{DerivedQuantity, Report, ReportOptions, build_report};
use crate::linalg::faer_ndarray::FaerLinalgError;
use crate::model::LatentGaussianModel;
use crate::objective::ObjectiveTerms;
use crate::solver::inner::InnerOptions;
use crate::solver::laml::LaplaceObjective;
use crate::solver::smoothing::{OuterOptimizer, OuterOptions, WolfeBfgs};
use crate::types::{LatentField, ParameterTransform};
use faer::sparse::SparseColMat;
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or fitting a model.
#[derive(Error)]
pub enum EstimationError {
    #[error("Invalid model structure: {0}")]
    Structural(String),

    #[error("Precision matrix is not positive definite ({context}): {reason}")]
    SingularPrecision { context: String, reason: String },

    #[error(
        "The inner Newton search did not converge within {max_iterations} iterations. Last gradient norm was {last_gradient_norm:.6e}."
    )]
    InnerConvergence {
        max_iterations: usize,
        last_gradient_norm: f64,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Outer optimization failed: {0}")]
    OuterOptimizationFailed(String),

    #[error("A linear system solve failed: {0}")]
    LinearSystemSolveFailed(String),

    #[error("Eigendecomposition failed: {0}")]
    EigendecompositionFailed(FaerLinalgError),
}

// Ensure Debug prints with actual line breaks by delegating to Display
impl core::fmt::Debug for EstimationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitOptions {
    #[serde(default)]
    pub inner: InnerOptions,
    #[serde(default)]
    pub outer: OuterOptions,
    #[serde(default)]
    pub report: ReportOptions,
}

/// Estimated parameters, latent mode and curvature of a fitted model.
#[derive(Clone)]
pub struct FitResult {
    model: LatentGaussianModel,
    options: FitOptions,
    theta: Vec<f64>,
    free: Array1<f64>,
    value: f64,
    terms: ObjectiveTerms,
    mode: LatentField,
    inner_hessian: SparseColMat<usize, f64>,
    iterations: usize,
    gradient_norm: f64,
    converged: bool,
}

impl FitResult {
    pub fn model(&self) -> &LatentGaussianModel {
        &self.model
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    /// Full parameter vector on the optimizer scale.
    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    /// Free parameters at the optimum.
    pub fn free_parameters(&self) -> &Array1<f64> {
        &self.free
    }

    /// `(name, optimizer-scale value)` for every parameter.
    pub fn parameters(&self) -> Vec<(String, f64)> {
        self.model
            .layout()
            .specs()
            .iter()
            .zip(&self.theta)
            .map(|(spec, &v)| (spec.name.clone(), v))
            .collect()
    }

    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.model.layout().index_of(name).map(|i| self.theta[i])
    }

    /// Value on the natural scale (`exp(θ)` for log-scale parameters).
    pub fn natural_parameter(&self, name: &str) -> Option<f64> {
        let layout = self.model.layout();
        layout
            .index_of(name)
            .map(|i| layout.specs()[i].transform.to_natural(self.theta[i]))
    }

    /// Laplace-approximate negative log marginal likelihood at the optimum.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn terms(&self) -> ObjectiveTerms {
        self.terms
    }

    pub fn mode(&self) -> &LatentField {
        &self.mode
    }

    pub fn inner_hessian(&self) -> &SparseColMat<usize, f64> {
        &self.inner_hessian
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn gradient_norm(&self) -> f64 {
        self.gradient_norm
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// `2L + 2k` with `k` the number of estimated parameters.
    pub fn aic(&self) -> f64 {
        2.0 * self.value + 2.0 * self.free.len() as f64
    }

    /// Log-scale parameters on their natural scale.
    pub fn natural_parameters(&self) -> Vec<(String, f64)> {
        self.model
            .layout()
            .specs()
            .iter()
            .zip(&self.theta)
            .filter(|(spec, _)| spec.transform == ParameterTransform::Log)
            .map(|(spec, &v)| (spec.name.clone(), v.exp()))
            .collect()
    }

    /// Built-in quantities with delta-method standard errors.
    pub fn report(&self) -> Result<Report, EstimationError> {
        build_report(self, &[])
    }

    /// Built-in quantities plus caller-defined ones.
    pub fn report_with(&self, extra: &[DerivedQuantity]) -> Result<Report, EstimationError> {
        build_report(self, extra)
    }
}

/// Fit with the default BFGS outer optimizer.
pub fn fit_model(
    model: &LatentGaussianModel,
    options: &FitOptions,
) -> Result<FitResult, EstimationError> {
    let optimizer = WolfeBfgs::new(options.outer.clone());
    fit_model_with(model, options, &optimizer)
}

/// Fit with a caller-provided outer optimizer.
pub fn fit_model_with(
    model: &LatentGaussianModel,
    options: &FitOptions,
    optimizer: &dyn OuterOptimizer,
) -> Result<FitResult, EstimationError> {
    let objective = LaplaceObjective::new(model, options.inner.clone());
    let start = model.initial_free();
    log::debug!(
        "[fit] {} latent elements, {} observations, {} free parameters",
        model.n_latent(),
        model.n_obs(),
        start.len()
    );

    // Make sure the starting point is usable before handing it to the optimizer.
    objective.evaluate(&start)?;

    let bounds = model.free_bounds(options.outer.parameter_bound);
    let mut outer = |free: &Array1<f64>| objective.value(free);
    let solution = optimizer.minimize(&start, &bounds, &mut outer)?;
    if !solution.converged {
        log::warn!(
            "[fit] outer optimizer stopped without convergence (|grad| {:.3e})",
            solution.gradient_norm
        );
    }

    let evaluation = objective.evaluate(&solution.point)?;
    Ok(FitResult {
        model: model.clone(),
        options: options.clone(),
        theta: evaluation.theta,
        free: solution.point,
        value: evaluation.value,
        terms: evaluation.terms,
        mode: evaluation.inner.mode,
        inner_hessian: evaluation.inner.hessian,
        iterations: solution.iterations,
        gradient_norm: solution.gradient_norm,
        converged: solution.converged,
    })
}

/// Fit independent models in parallel; each fit owns its own state.
pub fn fit_models(
    models: &[LatentGaussianModel],
    options: &FitOptions,
) -> Vec<Result<FitResult, EstimationError>> {
    models
        .par_iter()
        .map(|model| fit_model(model, options))
        .collect()
}
