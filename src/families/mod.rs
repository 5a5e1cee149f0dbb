pub mod glm;
pub mod survival;

use crate::estimate::EstimationError;
use crate::linalg::utils::KahanSum;
use crate::precision::ParameterSpec;
use crate::probability::{ln_binomial, ln_factorial};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Response distribution and link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationFamily {
    /// Right-censored Weibull with log-rate `η`; one hyperparameter `log_shape`.
    WeibullSurvival,
    /// Gaussian with identity link; one hyperparameter `log_sigma_obs`.
    Gaussian,
    /// Binomial (Bernoulli when every trial count is one) with logit link.
    Binomial,
    /// Poisson with log link.
    Poisson,
}

impl ObservationFamily {
    pub fn hyper_specs(self) -> Vec<ParameterSpec> {
        match self {
            ObservationFamily::WeibullSurvival => vec![ParameterSpec::log("log_shape", 0.0)],
            ObservationFamily::Gaussian => vec![ParameterSpec::log("log_sigma_obs", 0.0)],
            ObservationFamily::Binomial | ObservationFamily::Poisson => Vec::new(),
        }
    }

    pub fn n_hyper(self) -> usize {
        match self {
            ObservationFamily::WeibullSurvival | ObservationFamily::Gaussian => 1,
            ObservationFamily::Binomial | ObservationFamily::Poisson => 0,
        }
    }
}

/// Validated observations for one family.
///
/// Per-observation constants that do not depend on `η` (`ln t`, `log C(n,y)`,
/// `log y!`) are computed once at load time.
#[derive(Debug, Clone)]
pub struct Observations {
    family: ObservationFamily,
    response: Array1<f64>,
    events: Option<Array1<u8>>,
    trials: Option<Array1<f64>>,
    constants: Array1<f64>,
}

impl Observations {
    /// Survival times with event indicators (1 = event observed, 0 = censored).
    pub fn weibull(times: Array1<f64>, events: Array1<u8>) -> Result<Self, EstimationError> {
        if times.len() != events.len() {
            return Err(EstimationError::Configuration(format!(
                "{} survival times but {} event indicators",
                times.len(),
                events.len()
            )));
        }
        check_finite(&times)?;
        if let Some((i, t)) = times.iter().enumerate().find(|(_, t)| **t <= 0.0) {
            return Err(EstimationError::Configuration(format!(
                "survival time {i} is {t}; times must be positive"
            )));
        }
        if let Some((i, e)) = events.iter().enumerate().find(|(_, e)| **e > 1) {
            return Err(EstimationError::Configuration(format!(
                "event indicator {i} is {e}; expected 0 or 1"
            )));
        }
        let constants = times.mapv(f64::ln);
        Ok(Self {
            family: ObservationFamily::WeibullSurvival,
            response: times,
            events: Some(events),
            trials: None,
            constants,
        })
    }

    pub fn gaussian(response: Array1<f64>) -> Result<Self, EstimationError> {
        check_finite(&response)?;
        let constants = Array1::zeros(response.len());
        Ok(Self {
            family: ObservationFamily::Gaussian,
            response,
            events: None,
            trials: None,
            constants,
        })
    }

    /// Successes out of `trials` per observation.
    pub fn binomial(successes: Array1<f64>, trials: Array1<f64>) -> Result<Self, EstimationError> {
        if successes.len() != trials.len() {
            return Err(EstimationError::Configuration(format!(
                "{} binomial responses but {} trial counts",
                successes.len(),
                trials.len()
            )));
        }
        check_finite(&successes)?;
        check_finite(&trials)?;
        for (i, (&y, &n)) in successes.iter().zip(trials.iter()).enumerate() {
            if n <= 0.0 || y < 0.0 || y > n {
                return Err(EstimationError::Configuration(format!(
                    "binomial observation {i} has {y} successes out of {n} trials"
                )));
            }
        }
        let constants = successes
            .iter()
            .zip(trials.iter())
            .map(|(&y, &n)| if n > 1.0 { ln_binomial(n, y) } else { 0.0 })
            .collect();
        Ok(Self {
            family: ObservationFamily::Binomial,
            response: successes,
            events: None,
            trials: Some(trials),
            constants,
        })
    }

    /// 0/1 responses.
    pub fn bernoulli(response: Array1<f64>) -> Result<Self, EstimationError> {
        if let Some((i, y)) = response.iter().enumerate().find(|(_, y)| **y != 0.0 && **y != 1.0) {
            return Err(EstimationError::Configuration(format!(
                "Bernoulli response {i} is {y}; expected 0 or 1"
            )));
        }
        let trials = Array1::ones(response.len());
        Self::binomial(response, trials)
    }

    pub fn poisson(counts: Array1<f64>) -> Result<Self, EstimationError> {
        check_finite(&counts)?;
        if let Some((i, y)) = counts
            .iter()
            .enumerate()
            .find(|(_, y)| **y < 0.0 || y.fract() != 0.0)
        {
            return Err(EstimationError::Configuration(format!(
                "Poisson count {i} is {y}; counts must be non-negative integers"
            )));
        }
        let constants = counts.mapv(ln_factorial);
        Ok(Self {
            family: ObservationFamily::Poisson,
            response: counts,
            events: None,
            trials: None,
            constants,
        })
    }

    pub fn family(&self) -> ObservationFamily {
        self.family
    }

    pub fn len(&self) -> usize {
        self.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.response.is_empty()
    }

    pub fn response(&self) -> &Array1<f64> {
        &self.response
    }

    pub fn events(&self) -> Option<&Array1<u8>> {
        self.events.as_ref()
    }

    pub fn trials(&self) -> Option<&Array1<f64>> {
        self.trials.as_ref()
    }

    fn event(&self, i: usize) -> bool {
        self.events.as_ref().is_some_and(|e| e[i] == 1)
    }

    fn trial(&self, i: usize) -> f64 {
        self.trials.as_ref().map_or(1.0, |n| n[i])
    }

    fn check_inputs(
        &self,
        eta: &Array1<f64>,
        family_theta: &[f64],
    ) -> Result<(), EstimationError> {
        if eta.len() != self.len() {
            return Err(EstimationError::Configuration(format!(
                "linear predictor has length {} but there are {} observations",
                eta.len(),
                self.len()
            )));
        }
        if family_theta.len() != self.family.n_hyper() {
            return Err(EstimationError::Configuration(format!(
                "{:?} takes {} hyperparameter(s), got {}",
                self.family,
                self.family.n_hyper(),
                family_theta.len()
            )));
        }
        Ok(())
    }

    /// `−log p(y | η)` summed over observations. `family_theta` holds the
    /// family hyperparameters (see [`ObservationFamily::hyper_specs`]).
    pub fn neg_log_likelihood(
        &self,
        eta: &Array1<f64>,
        family_theta: &[f64],
    ) -> Result<f64, EstimationError> {
        self.check_inputs(eta, family_theta)?;
        let mut sum = KahanSum::default();
        for i in 0..self.len() {
            sum.add(self.point_neg_log_lik(i, eta[i], family_theta));
        }
        Ok(sum.sum())
    }

    fn point_neg_log_lik(&self, i: usize, eta: f64, family_theta: &[f64]) -> f64 {
        let y = self.response[i];
        let c = self.constants[i];
        match self.family {
            ObservationFamily::WeibullSurvival => {
                survival::weibull_neg_log_lik(eta, family_theta[0], c, self.event(i))
            }
            ObservationFamily::Gaussian => glm::gaussian_neg_log_lik(eta, y, family_theta[0]),
            ObservationFamily::Binomial => glm::binomial_neg_log_lik(eta, y, self.trial(i), c),
            ObservationFamily::Poisson => glm::poisson_neg_log_lik(eta, y, c),
        }
    }

    /// Per-observation first and second derivatives of `−log p(yᵢ | ηᵢ)`.
    pub fn eta_derivatives(
        &self,
        eta: &Array1<f64>,
        family_theta: &[f64],
    ) -> Result<(Array1<f64>, Array1<f64>), EstimationError> {
        self.check_inputs(eta, family_theta)?;
        let n = self.len();
        let mut grad = Array1::<f64>::zeros(n);
        let mut weight = Array1::<f64>::zeros(n);
        for i in 0..n {
            let y = self.response[i];
            let (g, w) = match self.family {
                ObservationFamily::WeibullSurvival => survival::weibull_eta_derivatives(
                    eta[i],
                    family_theta[0],
                    self.constants[i],
                    self.event(i),
                ),
                ObservationFamily::Gaussian => {
                    glm::gaussian_eta_derivatives(eta[i], y, family_theta[0])
                }
                ObservationFamily::Binomial => {
                    glm::binomial_eta_derivatives(eta[i], y, self.trial(i))
                }
                ObservationFamily::Poisson => glm::poisson_eta_derivatives(eta[i], y),
            };
            grad[i] = g;
            weight[i] = w;
        }
        Ok((grad, weight))
    }
}

fn check_finite(values: &Array1<f64>) -> Result<(), EstimationError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(i) => Err(EstimationError::Configuration(format!(
            "observation {i} is not finite ({})",
            values[i]
        ))),
        None => Ok(()),
    }
}
