use crate::density::JointDensity;
use crate::estimate::EstimationError;
use crate::model::LatentGaussianModel;
use crate::precision::PrecisionMatrix;
use crate::types::LatentField;
use serde::{Deserialize, Serialize};

/// Which terms an objective evaluation includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationMode {
    /// Prior quadratic form and data likelihood; used while searching for the
    /// latent mode, where `log|Q|` and hyper-priors are constant.
    Inner,
    /// Normalized prior, data likelihood and hyper-priors.
    Full,
    /// Normalized prior only; the data are never touched.
    PriorOnly,
}

/// Breakdown of one objective evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectiveTerms {
    pub prior: f64,
    pub likelihood: f64,
    pub hyper_prior: f64,
}

impl ObjectiveTerms {
    pub fn total(&self) -> f64 {
        self.prior + self.likelihood + self.hyper_prior
    }
}

/// Evaluate against an already assembled precision.
pub fn evaluate_with_precision(
    model: &LatentGaussianModel,
    precision: &PrecisionMatrix,
    latent: &LatentField,
    theta: &[f64],
    mode: EvaluationMode,
) -> Result<ObjectiveTerms, EstimationError> {
    model.check_theta(theta)?;
    let density = JointDensity::new(precision);
    let normalize = !matches!(mode, EvaluationMode::Inner);
    let prior = density.neg_log_density(latent, normalize)?;
    if mode == EvaluationMode::PriorOnly {
        return Ok(ObjectiveTerms {
            prior,
            ..ObjectiveTerms::default()
        });
    }
    let eta = model.linear_predictor(latent, theta)?;
    let likelihood = model
        .observations()
        .neg_log_likelihood(&eta, model.family_theta(theta))?;
    let hyper_prior = if mode == EvaluationMode::Full {
        model.hyper_prior_nll(theta)
    } else {
        0.0
    };
    Ok(ObjectiveTerms {
        prior,
        likelihood,
        hyper_prior,
    })
}

impl LatentGaussianModel {
    /// Objective at `(latent, theta)`, assembling the precision from `theta`.
    pub fn objective(
        &self,
        latent: &LatentField,
        theta: &[f64],
        mode: EvaluationMode,
    ) -> Result<ObjectiveTerms, EstimationError> {
        let precision = self.assemble_precision(theta)?;
        evaluate_with_precision(self, &precision, latent, theta, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::Observations;
    use crate::precision::FieldStructure;
    use crate::structure::BlockDiagonalPenalty;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn model() -> LatentGaussianModel {
        let structure =
            FieldStructure::Iid(BlockDiagonalPenalty::identity_blocks(&[2]).expect("iid"));
        let obs = Observations::gaussian(array![0.5, -0.5]).expect("obs");
        LatentGaussianModel::builder(structure, obs)
            .priors(
                crate::priors::HyperPriorSet::new()
                    .with("log_sigma_0", crate::priors::HyperPrior::Exponential { rate: 1.0 })
                    .expect("prior"),
            )
            .build()
            .expect("model")
    }

    #[test]
    fn modes_include_the_documented_terms() {
        let model = model();
        let u = LatentField::new(array![1.0, 0.0]);
        let theta = [0.0, 0.0];
        let inner = model.objective(&u, &theta, EvaluationMode::Inner).expect("inner");
        let full = model.objective(&u, &theta, EvaluationMode::Full).expect("full");
        let prior_only = model
            .objective(&u, &theta, EvaluationMode::PriorOnly)
            .expect("prior");

        // σ = 1: quadratic ½·1, log|Q| = 0.
        assert_abs_diff_eq!(inner.prior, 0.5, epsilon = 1e-14);
        assert_eq!(inner.hyper_prior, 0.0);
        assert_eq!(inner.likelihood, full.likelihood);
        // Exponential(1) at σ = 1 minus the Jacobian θ = 0.
        assert_abs_diff_eq!(full.hyper_prior, 1.0, epsilon = 1e-14);
        assert_eq!(prior_only.likelihood, 0.0);
        assert_eq!(prior_only.prior, full.prior);
    }

    #[test]
    fn normalizing_constant_only_shifts_by_log_determinant() {
        let model = model();
        let u = LatentField::new(array![0.3, -0.2]);
        let theta = [0.4, 0.1];
        let inner = model.objective(&u, &theta, EvaluationMode::Inner).expect("inner");
        let full = model.objective(&u, &theta, EvaluationMode::Full).expect("full");
        // log|Q| = 2·(−2·0.4); −½log|Q| = 0.8.
        assert_abs_diff_eq!(full.prior - inner.prior, 0.8, epsilon = 1e-12);
    }
}
