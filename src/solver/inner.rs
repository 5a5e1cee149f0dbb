use crate::estimate::EstimationError;
use crate::linalg::sparse_exact::{
    SparseExactFactor, factorize_sparse_spd, solve_sparse_spd, sparse_from_entries,
    sparse_matvec, sparse_to_entries,
};
use crate::model::LatentGaussianModel;
use crate::objective::{EvaluationMode, evaluate_with_precision};
use crate::precision::PrecisionMatrix;
use crate::types::LatentField;
use faer::sparse::SparseColMat;
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerOptions {
    /// Converged when `‖∇f‖∞ ≤ tolerance·(1 + |f|)`.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub max_step_halvings: usize,
    /// Standard deviation of the perturbation applied to the start before the
    /// single retry after non-convergence.
    pub retry_perturbation_sd: f64,
    pub seed: u64,
}

impl Default for InnerOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 100,
            max_step_halvings: 30,
            retry_perturbation_sd: 0.1,
            seed: 0x5eed,
        }
    }
}

/// Latent mode and the curvature there.
#[derive(Clone)]
pub struct InnerSolution {
    pub mode: LatentField,
    /// `H = Q + s²·AᵀWA` at the mode.
    pub hessian: SparseColMat<usize, f64>,
    pub factor: SparseExactFactor,
    /// Inner-mode objective (prior quadratic form plus likelihood).
    pub value: f64,
    pub iterations: usize,
    pub gradient_norm: f64,
}

impl InnerSolution {
    pub fn log_det_hessian(&self) -> f64 {
        crate::linalg::sparse_exact::logdet_from_factor(&self.factor)
    }
}

/// Minimize the inner objective over the latent field starting from `start`.
///
/// Non-convergence triggers one retry from a seeded random perturbation of
/// `start` before the error is returned.
pub fn find_mode(
    model: &LatentGaussianModel,
    precision: &PrecisionMatrix,
    theta: &[f64],
    start: &Array1<f64>,
    options: &InnerOptions,
) -> Result<InnerSolution, EstimationError> {
    match newton(model, precision, theta, start, options) {
        Err(EstimationError::InnerConvergence {
            max_iterations,
            last_gradient_norm,
        }) => {
            log::warn!(
                "[inner] no convergence after {} iterations (|grad| {:.3e}); retrying from perturbed start",
                max_iterations,
                last_gradient_norm
            );
            let perturbed = perturb(start, options)?;
            newton(model, precision, theta, &perturbed, options)
        }
        other => other,
    }
}

fn perturb(start: &Array1<f64>, options: &InnerOptions) -> Result<Array1<f64>, EstimationError> {
    let normal = Normal::new(0.0, options.retry_perturbation_sd).map_err(|e| {
        EstimationError::Configuration(format!("invalid retry perturbation: {e}"))
    })?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    Ok(start.mapv(|v| v + normal.sample(&mut rng)))
}

/// `Q + s²·AᵀWA`.
pub fn inner_hessian(
    model: &LatentGaussianModel,
    precision: &PrecisionMatrix,
    theta: &[f64],
    weights: &Array1<f64>,
) -> Result<SparseColMat<usize, f64>, EstimationError> {
    let n = precision.dim();
    let mut entries = sparse_to_entries(precision.matrix());
    let gram = model
        .link()
        .weighted_gram(weights, model.field_scale(theta))?;
    for (key, value) in gram {
        *entries.entry(key).or_insert(0.0) += value;
    }
    sparse_from_entries(n, n, &entries)
}

/// Gradient of the inner objective and the likelihood weights at `latent`.
pub fn inner_gradient(
    model: &LatentGaussianModel,
    precision: &PrecisionMatrix,
    latent: &LatentField,
    theta: &[f64],
) -> Result<(Array1<f64>, Array1<f64>), EstimationError> {
    let eta = model.linear_predictor(latent, theta)?;
    let (g_obs, weights) = model
        .observations()
        .eta_derivatives(&eta, model.family_theta(theta))?;
    let residual = &latent.0 - precision.mean();
    let mut grad = sparse_matvec(precision.matrix(), &residual);
    grad.scaled_add(model.field_scale(theta), &model.link().apply_transpose(&g_obs));
    Ok((grad, weights))
}

fn inner_value(
    model: &LatentGaussianModel,
    precision: &PrecisionMatrix,
    latent: &LatentField,
    theta: &[f64],
) -> Result<f64, EstimationError> {
    Ok(evaluate_with_precision(model, precision, latent, theta, EvaluationMode::Inner)?.total())
}

fn newton(
    model: &LatentGaussianModel,
    precision: &PrecisionMatrix,
    theta: &[f64],
    start: &Array1<f64>,
    options: &InnerOptions,
) -> Result<InnerSolution, EstimationError> {
    if start.len() != precision.dim() {
        return Err(EstimationError::Configuration(format!(
            "inner start has length {} but the latent field has {} elements",
            start.len(),
            precision.dim()
        )));
    }
    let mut latent = LatentField::new(start.clone());
    let mut value = inner_value(model, precision, &latent, theta)?;
    if !value.is_finite() {
        return Err(EstimationError::InnerConvergence {
            max_iterations: 0,
            last_gradient_norm: f64::INFINITY,
        });
    }
    let mut gradient_norm = f64::INFINITY;

    for iteration in 0..=options.max_iterations {
        let (grad, weights) = inner_gradient(model, precision, &latent, theta)?;
        gradient_norm = grad.iter().fold(0.0_f64, |m, g| m.max(g.abs()));
        if !gradient_norm.is_finite() {
            break;
        }
        let hessian = inner_hessian(model, precision, theta, &weights)?;
        let factor = factorize_sparse_spd(&hessian, "inner Hessian")?;

        if gradient_norm <= options.tolerance * (1.0 + value.abs()) {
            log::debug!(
                "[inner] converged at iter {:>3} | f {:.6e} | |grad| {:.3e}",
                iteration,
                value,
                gradient_norm
            );
            return Ok(InnerSolution {
                mode: latent,
                hessian,
                factor,
                value,
                iterations: iteration,
                gradient_norm,
            });
        }
        if iteration == options.max_iterations {
            break;
        }

        let direction = solve_sparse_spd(&factor, &grad)?;
        let mut step = 1.0_f64;
        let mut accepted = false;
        for halving in 0..=options.max_step_halvings {
            let candidate = LatentField::new(&latent.0 - &(step * &direction));
            let candidate_value = inner_value(model, precision, &candidate, theta)?;
            if candidate_value.is_finite()
                && candidate_value <= value + 1e-12 * (1.0 + value.abs())
            {
                log::debug!(
                    "[inner] iter {:>3} | f {:.6e} | |grad| {:.3e} | step {:.3e} (halving {})",
                    iteration,
                    candidate_value,
                    gradient_norm,
                    step,
                    halving
                );
                latent = candidate;
                value = candidate_value;
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted {
            log::debug!(
                "[inner] step halving exhausted at iter {} (|grad| {:.3e})",
                iteration,
                gradient_norm
            );
            break;
        }
    }

    Err(EstimationError::InnerConvergence {
        max_iterations: options.max_iterations,
        last_gradient_norm: gradient_norm,
    })
}
