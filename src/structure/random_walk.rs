use crate::estimate::EstimationError;
use crate::linalg::sparse_exact::{SparseEntries, sparse_from_entries};
use faer::sparse::SparseColMat;
use ndarray::Array1;
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// How the prior mean of each state after the first is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecruitmentDynamics {
    /// `x_t ~ N(x_{t-1}, σ²)`.
    RandomWalk,
    /// `x_t ~ N(α + ln S_{t-1} − e^β·S_{t-1}, σ²)`.
    Ricker,
    /// `x_t ~ N(α + ln S_{t-1} − ln(1 + e^β·S_{t-1}), σ²)`.
    BevertonHolt,
}

impl RecruitmentDynamics {
    /// Map the conventional integer switch (0, 1, 2) onto a variant.
    pub fn from_code(code: i64) -> Result<Self, EstimationError> {
        match code {
            0 => Ok(Self::RandomWalk),
            1 => Ok(Self::Ricker),
            2 => Ok(Self::BevertonHolt),
            other => Err(EstimationError::Configuration(format!(
                "unknown recruitment dynamics code {other}; expected 0 (random walk), 1 (Ricker) or 2 (Beverton-Holt)"
            ))),
        }
    }

    /// Whether the variant carries `α`, `β` and needs spawning-stock biomass.
    pub fn uses_stock(self) -> bool {
        !matches!(self, Self::RandomWalk)
    }

    /// Predicted log recruitment from the preceding year's stock.
    pub fn prediction<T: Float>(self, alpha: T, beta: T, ssb: T) -> T {
        match self {
            Self::RandomWalk => T::nan(),
            Self::Ricker => ricker_prediction(alpha, beta, ssb),
            Self::BevertonHolt => beverton_holt_prediction(alpha, beta, ssb),
        }
    }
}

/// `α + ln S − e^β·S`.
#[inline]
pub fn ricker_prediction<T: Float>(alpha: T, beta: T, ssb: T) -> T {
    alpha + ssb.ln() - beta.exp() * ssb
}

/// `α + ln S − ln(1 + e^β·S)`.
#[inline]
pub fn beverton_holt_prediction<T: Float>(alpha: T, beta: T, ssb: T) -> T {
    alpha + ssb.ln() - (beta.exp() * ssb).ln_1p()
}

/// Structure of a length-`T` latent sequence.
///
/// The first state carries no prior information. The first-difference
/// operator is never stored; the tridiagonal (or diagonal) precision is
/// emitted on demand.
#[derive(Clone, Debug)]
pub struct StateSpaceStructure {
    len: usize,
    dynamics: RecruitmentDynamics,
    ssb: Option<Array1<f64>>,
}

impl StateSpaceStructure {
    pub fn random_walk(len: usize) -> Result<Self, EstimationError> {
        if len < 2 {
            return Err(EstimationError::Structural(format!(
                "random walk needs at least two states, got {len}"
            )));
        }
        Ok(Self {
            len,
            dynamics: RecruitmentDynamics::RandomWalk,
            ssb: None,
        })
    }

    /// Stock–recruitment structure over `ssb.len()` years.
    pub fn recruitment(
        dynamics: RecruitmentDynamics,
        ssb: Array1<f64>,
    ) -> Result<Self, EstimationError> {
        if !dynamics.uses_stock() {
            return Self::random_walk(ssb.len());
        }
        if ssb.len() < 2 {
            return Err(EstimationError::Structural(format!(
                "recruitment model needs at least two years, got {}",
                ssb.len()
            )));
        }
        if let Some((year, &s)) = ssb.iter().enumerate().find(|(_, s)| !(s.is_finite() && **s > 0.0)) {
            return Err(EstimationError::Configuration(format!(
                "spawning-stock biomass must be positive and finite; year {year} has {s}"
            )));
        }
        Ok(Self {
            len: ssb.len(),
            dynamics,
            ssb: Some(ssb),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dynamics(&self) -> RecruitmentDynamics {
        self.dynamics
    }

    pub fn ssb(&self) -> Option<&Array1<f64>> {
        self.ssb.as_ref()
    }

    /// Rank of the precision: every state but the first is informed.
    pub fn rank(&self) -> usize {
        self.len - 1
    }

    /// Precision with `σ = exp(log_sigma)`.
    pub fn precision(&self, log_sigma: f64) -> Result<SparseColMat<usize, f64>, EstimationError> {
        let inv_var = (-2.0 * log_sigma).exp();
        let n = self.len;
        let mut entries = SparseEntries::new();
        match self.dynamics {
            RecruitmentDynamics::RandomWalk => {
                for i in 0..n {
                    let neighbours = usize::from(i > 0) + usize::from(i + 1 < n);
                    entries.insert((i, i), neighbours as f64 * inv_var);
                    if i + 1 < n {
                        entries.insert((i + 1, i), -inv_var);
                        entries.insert((i, i + 1), -inv_var);
                    }
                }
            }
            RecruitmentDynamics::Ricker | RecruitmentDynamics::BevertonHolt => {
                entries.insert((0, 0), 0.0);
                for i in 1..n {
                    entries.insert((i, i), inv_var);
                }
            }
        }
        sparse_from_entries(n, n, &entries)
    }

    /// Prior mean: zero for the random walk, `pred_t` from `ssb[t-1]` for the
    /// recruitment variants (the first entry stays zero).
    pub fn mean(&self, alpha: f64, beta: f64) -> Array1<f64> {
        let mut mean = Array1::<f64>::zeros(self.len);
        if let Some(ssb) = &self.ssb {
            for t in 1..self.len {
                mean[t] = self.dynamics.prediction(alpha, beta, ssb[t - 1]);
            }
        }
        mean
    }

    /// Closed-form log-determinant of the informed part, `(T−1)·(−2 ln σ)`.
    pub fn log_pdet(&self, log_sigma: f64) -> f64 {
        self.rank() as f64 * (-2.0 * log_sigma)
    }
}
