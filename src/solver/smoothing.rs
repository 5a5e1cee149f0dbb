use crate::estimate::EstimationError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use wolfe_bfgs::{Bfgs, BfgsError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Step of the central differences used for the outer gradient.
    pub finite_diff_step: f64,
    /// Log-scale parameters are kept inside `[-bound, bound]`; identity-scale
    /// parameters are unbounded.
    pub parameter_bound: f64,
}

impl Default for OuterOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-6,
            finite_diff_step: 1e-4,
            parameter_bound: 30.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OuterSolution {
    pub point: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
    pub gradient_norm: f64,
    pub converged: bool,
}

/// Scalar outer objective; errors mark a failed trial.
pub type OuterObjective<'a> = dyn FnMut(&Array1<f64>) -> Result<f64, EstimationError> + 'a;

/// Per-coordinate box of the outer search. Infinite entries leave a coordinate free.
#[derive(Debug, Clone, PartialEq)]
pub struct OuterBounds {
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
}

impl OuterBounds {
    pub fn unbounded(len: usize) -> Self {
        Self {
            lower: Array1::from_elem(len, f64::NEG_INFINITY),
            upper: Array1::from_elem(len, f64::INFINITY),
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    fn validate(&self, dim: usize) -> Result<(), EstimationError> {
        if self.lower.len() != dim || self.upper.len() != dim {
            return Err(EstimationError::Configuration(format!(
                "outer bounds have lengths {}/{} but the search has {dim} coordinates",
                self.lower.len(),
                self.upper.len()
            )));
        }
        if let Some(i) = (0..dim).find(|&i| !(self.lower[i] <= self.upper[i])) {
            return Err(EstimationError::Configuration(format!(
                "outer bound {i} is empty: [{}, {}]",
                self.lower[i], self.upper[i]
            )));
        }
        Ok(())
    }

    pub fn clamp(&self, point: &Array1<f64>) -> Array1<f64> {
        Array1::from_iter(
            point
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .map(|(&x, (&lo, &hi))| x.clamp(lo, hi)),
        )
    }

    /// Coordinates resting on a finite bound.
    pub fn active(&self, point: &Array1<f64>, tol: f64) -> Vec<usize> {
        (0..point.len())
            .filter(|&i| {
                let (lo, hi) = (self.lower[i], self.upper[i]);
                (lo.is_finite() && point[i] <= lo + tol) || (hi.is_finite() && point[i] >= hi - tol)
            })
            .collect()
    }
}

/// Minimizer of the Laplace objective over the free parameters.
pub trait OuterOptimizer: Sync {
    fn minimize(
        &self,
        start: &Array1<f64>,
        bounds: &OuterBounds,
        objective: &mut OuterObjective<'_>,
    ) -> Result<OuterSolution, EstimationError>;
}

/// BFGS with a Wolfe line search and finite-difference gradients.
#[derive(Debug, Clone, Default)]
pub struct WolfeBfgs {
    pub options: OuterOptions,
}

impl WolfeBfgs {
    pub fn new(options: OuterOptions) -> Self {
        Self { options }
    }
}

pub(crate) fn finite_diff_gradient_external<F>(
    point: &Array1<f64>,
    step: f64,
    objective: &mut F,
) -> Result<Array1<f64>, EstimationError>
where
    F: FnMut(&Array1<f64>) -> Result<f64, EstimationError> + ?Sized,
{
    // g_k ≈ [L(x + h e_k) − L(x − h e_k)] / (2h)
    let mut grad = Array1::<f64>::zeros(point.len());
    let mut xp = point.clone();
    let mut xm = point.clone();
    for i in 0..point.len() {
        xp[i] += step;
        let fp = objective(&xp)?;
        xm[i] -= step;
        let fm = objective(&xm)?;
        grad[i] = (fp - fm) / (2.0 * step);
        xp[i] = point[i];
        xm[i] = point[i];
    }
    Ok(grad)
}

const BOUND_TOL: f64 = 1e-6;

fn invalid_bfgs_sample(point: &Array1<f64>) -> (f64, Array1<f64>) {
    // Failed trials become a large smooth barrier so the line search retreats.
    const COST_BARRIER: f64 = 1e50;
    const GRAD_SCALE: f64 = 1e6;

    let mut grad = point.clone();
    for g in grad.iter_mut() {
        if !g.is_finite() || g.abs() < 1e-6 {
            *g = 1.0;
        }
    }
    grad *= GRAD_SCALE;
    (COST_BARRIER + 0.5 * point.dot(point), grad)
}

fn approx_same_point(a: &Array1<f64>, b: &Array1<f64>) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= 1e-12)
}

impl OuterOptimizer for WolfeBfgs {
    fn minimize(
        &self,
        start: &Array1<f64>,
        bounds: &OuterBounds,
        objective: &mut OuterObjective<'_>,
    ) -> Result<OuterSolution, EstimationError> {
        let options = &self.options;
        bounds.validate(start.len())?;
        if start.is_empty() {
            return Ok(OuterSolution {
                point: start.clone(),
                value: objective(start)?,
                iterations: 0,
                gradient_norm: 0.0,
                converged: true,
            });
        }

        let last_eval: std::cell::RefCell<Option<(Array1<f64>, f64, Array1<f64>)>> =
            std::cell::RefCell::new(None);
        let failures = std::cell::Cell::new(0usize);
        let start = bounds.clamp(start);

        let eval_cost_grad = std::cell::RefCell::new(|x: &Array1<f64>| -> Result<(f64, Array1<f64>), EstimationError> {
            let cost = objective(x)?;
            let grad = finite_diff_gradient_external(x, options.finite_diff_step, &mut *objective)?;
            Ok((cost, grad))
        });

        let optimizer = Bfgs::new(start.clone(), |x| {
            if let Some((x_c, cost_c, grad_c)) = &*last_eval.borrow()
                && approx_same_point(x, x_c)
            {
                return (*cost_c, grad_c.clone());
            }
            let sample = match (eval_cost_grad.borrow_mut())(x) {
                Ok((cost, grad)) if cost.is_finite() && grad.iter().all(|v| v.is_finite()) => {
                    (cost, grad)
                }
                Ok(_) => {
                    failures.set(failures.get() + 1);
                    log::warn!("[outer] non-finite trial; returning barrier sample");
                    invalid_bfgs_sample(x)
                }
                Err(e) => {
                    failures.set(failures.get() + 1);
                    log::warn!("[outer] trial failed ({e}); returning barrier sample");
                    invalid_bfgs_sample(x)
                }
            };
            *last_eval.borrow_mut() = Some((x.clone(), sample.0, sample.1.clone()));
            sample
        })
        .with_bounds(bounds.lower.clone(), bounds.upper.clone(), BOUND_TOL)
        .with_tolerance(options.tolerance)
        .with_max_iterations(options.max_iterations);

        let (solution, converged) = match optimizer.run() {
            Ok(sol) => (sol, true),
            Err(BfgsError::MaxIterationsReached { last_solution }) => {
                log::warn!("[outer] BFGS reached the iteration limit");
                (*last_solution, false)
            }
            Err(BfgsError::LineSearchFailed { last_solution, .. }) => {
                log::debug!("[outer] line search stalled; accepting last iterate");
                (*last_solution, false)
            }
            Err(_) => {
                return Err(EstimationError::OuterOptimizationFailed(
                    "BFGS failed before producing an iterate".to_string(),
                ));
            }
        };
        drop(optimizer);

        let point = solution.final_point.clone();
        let last_eval = last_eval.into_inner();
        let failures = failures.get();
        let gradient_norm = match &last_eval {
            Some((x_c, _, grad_c)) if approx_same_point(&point, x_c) => grad_c.dot(grad_c).sqrt(),
            _ => solution.final_gradient_norm,
        };
        if failures > 0 {
            log::debug!("[outer] {failures} trial(s) replaced by barrier samples");
        }
        if solution.final_value >= 1e49 {
            return Err(EstimationError::OuterOptimizationFailed(
                "every outer trial failed".to_string(),
            ));
        }
        // A stalled line search at a stationary point is still a solution.
        let mut converged = converged || gradient_norm <= options.tolerance.max(1e-4);
        let active = bounds.active(&point, BOUND_TOL);
        if !active.is_empty() {
            log::warn!("[outer] coordinates {active:?} finished on their bounds");
            converged = false;
        }
        log::debug!(
            "[outer] finished after {} iterations | L {:.6e} | |grad| {:.3e}",
            solution.iterations,
            solution.final_value,
            gradient_norm
        );
        Ok(OuterSolution {
            point,
            value: solution.final_value,
            iterations: solution.iterations,
            gradient_norm,
            converged,
        })
    }
}
