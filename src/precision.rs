use crate::estimate::EstimationError;
use crate::linalg::sparse_exact::{factorize_sparse_spd, logdet_from_factor};
use crate::structure::{BlockDiagonalPenalty, SpdeMatrices, StateSpaceStructure};
use crate::types::ParameterTransform;
use faer::sparse::SparseColMat;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// How `log|Q|` is obtained for an assembled precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogDeterminant {
    /// Full-rank precision; the determinant comes from a sparse Cholesky
    /// factorization when requested.
    Factorize,
    /// Rank-deficient (intrinsic) precision whose generalized determinant is
    /// known in closed form.
    Intrinsic { rank: usize, value: f64 },
}

/// Sparse symmetric precision (both triangles stored) with its prior mean.
#[derive(Clone)]
pub struct PrecisionMatrix {
    matrix: SparseColMat<usize, f64>,
    mean: Array1<f64>,
    log_det: LogDeterminant,
}

impl PrecisionMatrix {
    pub fn new(
        matrix: SparseColMat<usize, f64>,
        mean: Array1<f64>,
        log_det: LogDeterminant,
    ) -> Result<Self, EstimationError> {
        if matrix.nrows() != matrix.ncols() || mean.len() != matrix.nrows() {
            return Err(EstimationError::Structural(format!(
                "precision is {}x{} with a mean of length {}",
                matrix.nrows(),
                matrix.ncols(),
                mean.len()
            )));
        }
        Ok(Self {
            matrix,
            mean,
            log_det,
        })
    }

    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &SparseColMat<usize, f64> {
        &self.matrix
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn log_determinant_rule(&self) -> LogDeterminant {
        self.log_det
    }

    /// Rank used by the density normalization.
    pub fn rank(&self) -> usize {
        match self.log_det {
            LogDeterminant::Factorize => self.dim(),
            LogDeterminant::Intrinsic { rank, .. } => rank,
        }
    }

    /// `log|Q|`, or the generalized determinant for intrinsic structures.
    pub fn log_determinant(&self) -> Result<f64, EstimationError> {
        match self.log_det {
            LogDeterminant::Factorize => {
                let factor = factorize_sparse_spd(&self.matrix, "latent precision")?;
                Ok(logdet_from_factor(&factor))
            }
            LogDeterminant::Intrinsic { value, .. } => Ok(value),
        }
    }
}

/// Name, scale and starting value of one hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub transform: ParameterTransform,
    pub initial: f64,
}

impl ParameterSpec {
    pub fn log(name: impl Into<String>, initial: f64) -> Self {
        Self {
            name: name.into(),
            transform: ParameterTransform::Log,
            initial,
        }
    }

    pub fn raw(name: impl Into<String>, initial: f64) -> Self {
        Self {
            name: name.into(),
            transform: ParameterTransform::Identity,
            initial,
        }
    }
}

/// Structural family of the latent field.
#[derive(Clone)]
pub enum FieldStructure {
    /// Matérn field via the SPDE; hyperparameters `log_tau`, `log_kappa`.
    Spde(SpdeMatrices),
    /// Penalized splines; one `log_lambda_i` per block.
    Splines(BlockDiagonalPenalty),
    /// IID random effects; one `log_sigma_i` per block, `λᵢ = σᵢ⁻²`.
    Iid(BlockDiagonalPenalty),
    /// Random walk (`log_sigma`) or recruitment chain (`log_sigma`, `alpha`,
    /// `beta`).
    StateSpace(StateSpaceStructure),
}

impl FieldStructure {
    pub fn dim(&self) -> usize {
        match self {
            FieldStructure::Spde(spde) => spde.dim(),
            FieldStructure::Splines(penalty) | FieldStructure::Iid(penalty) => penalty.dim(),
            FieldStructure::StateSpace(ss) => ss.len(),
        }
    }

    pub fn hyper_specs(&self) -> Vec<ParameterSpec> {
        match self {
            FieldStructure::Spde(_) => vec![
                ParameterSpec::log("log_tau", 0.0),
                ParameterSpec::log("log_kappa", 0.0),
            ],
            FieldStructure::Splines(penalty) => (0..penalty.n_blocks())
                .map(|i| ParameterSpec::log(format!("log_lambda_{i}"), 0.0))
                .collect(),
            FieldStructure::Iid(penalty) => (0..penalty.n_blocks())
                .map(|i| ParameterSpec::log(format!("log_sigma_{i}"), 0.0))
                .collect(),
            FieldStructure::StateSpace(ss) => {
                let mut specs = vec![ParameterSpec::log("log_sigma", 0.0)];
                if ss.dynamics().uses_stock() {
                    specs.push(ParameterSpec::raw("alpha", 0.0));
                    specs.push(ParameterSpec::raw("beta", 0.0));
                }
                specs
            }
        }
    }

    pub fn n_hyper(&self) -> usize {
        match self {
            FieldStructure::Spde(_) => 2,
            FieldStructure::Splines(penalty) | FieldStructure::Iid(penalty) => penalty.n_blocks(),
            FieldStructure::StateSpace(ss) => {
                if ss.dynamics().uses_stock() {
                    3
                } else {
                    1
                }
            }
        }
    }

    /// Build the precision for the given structure hyperparameters.
    pub fn assemble(&self, theta: &[f64]) -> Result<PrecisionMatrix, EstimationError> {
        if theta.len() != self.n_hyper() {
            return Err(EstimationError::Configuration(format!(
                "structure expects {} hyperparameters, got {}",
                self.n_hyper(),
                theta.len()
            )));
        }
        if let Some(bad) = theta.iter().find(|v| !v.is_finite()) {
            return Err(EstimationError::Configuration(format!(
                "non-finite hyperparameter {bad}"
            )));
        }
        let dim = self.dim();
        match self {
            FieldStructure::Spde(spde) => {
                let kappa = theta[1].exp();
                PrecisionMatrix::new(
                    spde.precision(kappa),
                    Array1::zeros(dim),
                    LogDeterminant::Factorize,
                )
            }
            FieldStructure::Splines(penalty) => {
                let lambdas: Vec<f64> = theta.iter().map(|t| t.exp()).collect();
                PrecisionMatrix::new(
                    penalty.assemble(&lambdas)?,
                    Array1::zeros(dim),
                    LogDeterminant::Intrinsic {
                        rank: penalty.total_rank(),
                        value: penalty.log_pdet(theta),
                    },
                )
            }
            FieldStructure::Iid(penalty) => {
                let log_lambdas: Vec<f64> = theta.iter().map(|log_sigma| -2.0 * log_sigma).collect();
                let lambdas: Vec<f64> = log_lambdas.iter().map(|l| l.exp()).collect();
                PrecisionMatrix::new(
                    penalty.assemble(&lambdas)?,
                    Array1::zeros(dim),
                    LogDeterminant::Intrinsic {
                        rank: penalty.total_rank(),
                        value: penalty.log_pdet(&log_lambdas),
                    },
                )
            }
            FieldStructure::StateSpace(ss) => {
                let log_sigma = theta[0];
                let mean = if ss.dynamics().uses_stock() {
                    ss.mean(theta[1], theta[2])
                } else {
                    Array1::zeros(dim)
                };
                if let Some(bad) = mean.iter().find(|v| !v.is_finite()) {
                    return Err(EstimationError::Configuration(format!(
                        "recruitment prediction is not finite ({bad})"
                    )));
                }
                PrecisionMatrix::new(
                    ss.precision(log_sigma)?,
                    mean,
                    LogDeterminant::Intrinsic {
                        rank: ss.rank(),
                        value: ss.log_pdet(log_sigma),
                    },
                )
            }
        }
    }

    /// Multiplier between the latent vector and its contribution to the linear
    /// predictor: `1/τ` for the SPDE field, one otherwise.
    pub fn field_scale(&self, theta: &[f64]) -> f64 {
        match self {
            FieldStructure::Spde(_) => theta.first().map_or(1.0, |log_tau| (-log_tau).exp()),
            _ => 1.0,
        }
    }
}
