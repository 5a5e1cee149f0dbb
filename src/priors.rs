use crate::estimate::EstimationError;
use crate::probability::LN_2PI;
use crate::types::ParameterTransform;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

/// Density of a hyperparameter on its natural scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum HyperPrior {
    /// Improper uniform density; contributes only the Jacobian term.
    Flat,
    Normal { mean: f64, sd: f64 },
    /// Shape/rate parameterization.
    Gamma { shape: f64, rate: f64 },
    Exponential { rate: f64 },
    HalfNormal { sd: f64 },
    /// Penalized-complexity prior on a standard deviation: exponential with
    /// `P(σ > upper) = tail_probability`.
    PenalizedComplexity { upper: f64, tail_probability: f64 },
}

impl HyperPrior {
    fn validate(&self) -> Result<(), EstimationError> {
        let ok = match *self {
            HyperPrior::Flat => true,
            HyperPrior::Normal { mean, sd } => mean.is_finite() && sd > 0.0 && sd.is_finite(),
            HyperPrior::Gamma { shape, rate } => {
                shape > 0.0 && rate > 0.0 && shape.is_finite() && rate.is_finite()
            }
            HyperPrior::Exponential { rate } => rate > 0.0 && rate.is_finite(),
            HyperPrior::HalfNormal { sd } => sd > 0.0 && sd.is_finite(),
            HyperPrior::PenalizedComplexity {
                upper,
                tail_probability,
            } => upper > 0.0 && upper.is_finite() && tail_probability > 0.0 && tail_probability < 1.0,
        };
        if ok {
            Ok(())
        } else {
            Err(EstimationError::Configuration(format!(
                "invalid hyper-prior parameters {self:?}"
            )))
        }
    }

    /// `−log p(x)` on the natural scale; `+∞` outside the support.
    pub fn neg_log_density(&self, x: f64) -> f64 {
        match *self {
            HyperPrior::Flat => 0.0,
            HyperPrior::Normal { mean, sd } => {
                let z = (x - mean) / sd;
                0.5 * LN_2PI + sd.ln() + 0.5 * z * z
            }
            HyperPrior::Gamma { shape, rate } => {
                if x <= 0.0 {
                    return f64::INFINITY;
                }
                ln_gamma(shape) - shape * rate.ln() - (shape - 1.0) * x.ln() + rate * x
            }
            HyperPrior::Exponential { rate } => {
                if x < 0.0 {
                    return f64::INFINITY;
                }
                rate * x - rate.ln()
            }
            HyperPrior::HalfNormal { sd } => {
                if x < 0.0 {
                    return f64::INFINITY;
                }
                let z = x / sd;
                0.5 * LN_2PI + sd.ln() - std::f64::consts::LN_2 + 0.5 * z * z
            }
            HyperPrior::PenalizedComplexity {
                upper,
                tail_probability,
            } => {
                let rate = -tail_probability.ln() / upper;
                HyperPrior::Exponential { rate }.neg_log_density(x)
            }
        }
    }
}

/// Hyper-priors attached to named parameters.
///
/// A parameter optimized on log scale gets the change-of-variables term
/// `−θ` added to its prior contribution unless the correction is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperPriorSet {
    entries: Vec<(String, HyperPrior)>,
    jacobian_correction: bool,
}

impl Default for HyperPriorSet {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            jacobian_correction: true,
        }
    }
}

impl HyperPriorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach (or replace) the prior on `name`.
    pub fn with(mut self, name: impl Into<String>, prior: HyperPrior) -> Result<Self, EstimationError> {
        prior.validate()?;
        let name = name.into();
        self.entries.retain(|(existing, _)| *existing != name);
        self.entries.push((name, prior));
        Ok(self)
    }

    pub fn with_jacobian_correction(mut self, enabled: bool) -> Self {
        self.jacobian_correction = enabled;
        self
    }

    pub fn jacobian_correction(&self) -> bool {
        self.jacobian_correction
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, HyperPrior)] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&HyperPrior> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    /// Prior contribution of one parameter given its optimizer-scale value.
    pub fn term(&self, prior: &HyperPrior, transform: ParameterTransform, theta: f64) -> f64 {
        let natural = transform.to_natural(theta);
        let mut nll = prior.neg_log_density(natural);
        if self.jacobian_correction {
            nll -= transform.log_jacobian(theta);
        }
        nll
    }
}
