use crate::estimate::EstimationError;
use crate::linalg::sparse_exact::{sparse_matvec, sparse_quadratic_form};
use crate::precision::PrecisionMatrix;
use ndarray::Array1;

/// `½(u−μ)ᵀQ(u−μ) − ½log|Q|`, with the `2π` constant dropped.
///
/// The log-determinant term is only evaluated when the normalizing constant
/// is requested; a singular `Factorize` precision is tolerated otherwise.
pub struct JointDensity<'a> {
    precision: &'a PrecisionMatrix,
}

impl<'a> JointDensity<'a> {
    pub fn new(precision: &'a PrecisionMatrix) -> Self {
        Self { precision }
    }

    pub fn precision(&self) -> &PrecisionMatrix {
        self.precision
    }

    fn check_len(&self, latent: &Array1<f64>) -> Result<(), EstimationError> {
        if latent.len() != self.precision.dim() {
            return Err(EstimationError::Configuration(format!(
                "latent field has length {} but the precision is {}x{}",
                latent.len(),
                self.precision.dim(),
                self.precision.dim()
            )));
        }
        Ok(())
    }

    /// `u − μ`.
    pub fn residual(&self, latent: &Array1<f64>) -> Result<Array1<f64>, EstimationError> {
        self.check_len(latent)?;
        Ok(latent - self.precision.mean())
    }

    pub fn quadratic_form(&self, latent: &Array1<f64>) -> Result<f64, EstimationError> {
        let r = self.residual(latent)?;
        Ok(sparse_quadratic_form(self.precision.matrix(), &r))
    }

    pub fn neg_log_density(
        &self,
        latent: &Array1<f64>,
        include_normalizing_constant: bool,
    ) -> Result<f64, EstimationError> {
        let mut nll = 0.5 * self.quadratic_form(latent)?;
        if include_normalizing_constant {
            nll -= 0.5 * self.precision.log_determinant()?;
        }
        Ok(nll)
    }

    /// `Q(u−μ)`, the gradient of the negative log density in `u`.
    pub fn gradient(&self, latent: &Array1<f64>) -> Result<Array1<f64>, EstimationError> {
        let r = self.residual(latent)?;
        Ok(sparse_matvec(self.precision.matrix(), &r))
    }
}
