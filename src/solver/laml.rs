//! Laplace-approximate marginal likelihood `L(θ) = f_full(û) + ½log|H(û)|`.
//!
//! The `2π` factors of the latent prior and of the Gaussian integral cancel,
//! so for Gaussian observations `L` equals the exact negative log marginal
//! likelihood (up to the constants the prior itself drops).

use crate::estimate::EstimationError;
use crate::model::LatentGaussianModel;
use crate::objective::{EvaluationMode, ObjectiveTerms, evaluate_with_precision};
use crate::precision::PrecisionMatrix;
use crate::solver::inner::{InnerOptions, InnerSolution, find_mode};
use ndarray::Array1;
use std::cell::RefCell;

/// Everything computed for one outer trial.
#[derive(Clone)]
pub struct LaplaceEvaluation {
    pub theta: Vec<f64>,
    pub value: f64,
    pub terms: ObjectiveTerms,
    pub log_det_hessian: f64,
    pub inner: InnerSolution,
    pub precision: PrecisionMatrix,
}

/// Outer objective over the free parameters of a model.
///
/// The last inner mode is kept and used to start the next inner search.
pub struct LaplaceObjective<'m> {
    model: &'m LatentGaussianModel,
    inner_options: InnerOptions,
    warm_start: RefCell<Option<Array1<f64>>>,
}

impl<'m> LaplaceObjective<'m> {
    pub fn new(model: &'m LatentGaussianModel, inner_options: InnerOptions) -> Self {
        Self {
            model,
            inner_options,
            warm_start: RefCell::new(None),
        }
    }

    pub fn model(&self) -> &LatentGaussianModel {
        self.model
    }

    pub fn set_warm_start(&self, mode: Option<Array1<f64>>) {
        *self.warm_start.borrow_mut() = mode;
    }

    /// Evaluate at a full parameter vector.
    pub fn evaluate_theta(&self, theta: &[f64]) -> Result<LaplaceEvaluation, EstimationError> {
        let precision = self.model.assemble_precision(theta)?;
        let start = match self.warm_start.borrow().as_ref() {
            Some(previous) if previous.len() == precision.dim() => previous.clone(),
            _ => precision.mean().clone(),
        };
        let inner = find_mode(self.model, &precision, theta, &start, &self.inner_options)?;
        let terms = evaluate_with_precision(
            self.model,
            &precision,
            &inner.mode,
            theta,
            EvaluationMode::Full,
        )?;
        let log_det_hessian = inner.log_det_hessian();
        let value = terms.total() + 0.5 * log_det_hessian;
        if !value.is_finite() {
            return Err(EstimationError::SingularPrecision {
                context: "Laplace objective".to_string(),
                reason: format!("non-finite value {value}"),
            });
        }
        *self.warm_start.borrow_mut() = Some(inner.mode.0.clone());
        Ok(LaplaceEvaluation {
            theta: theta.to_vec(),
            value,
            terms,
            log_det_hessian,
            inner,
            precision,
        })
    }

    /// Evaluate at the free parameters the outer optimizer moves.
    pub fn evaluate(&self, free: &Array1<f64>) -> Result<LaplaceEvaluation, EstimationError> {
        let theta = self.model.expand(free);
        self.evaluate_theta(&theta)
    }

    pub fn value(&self, free: &Array1<f64>) -> Result<f64, EstimationError> {
        Ok(self.evaluate(free)?.value)
    }

    /// Inner mode at the free parameters, without touching the warm start.
    pub fn mode_at(&self, free: &Array1<f64>) -> Result<Array1<f64>, EstimationError> {
        let saved = self.warm_start.borrow().clone();
        let result = self.evaluate(free).map(|e| e.inner.mode.0);
        self.set_warm_start(saved);
        result
    }
}
