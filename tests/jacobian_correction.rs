use gmrf::{
    BlockDiagonalPenalty, FieldStructure, FitOptions, HyperPrior, HyperPriorSet,
    LatentGaussianModel, LinkMap, Observations, fit_model,
};
use ndarray::Array1;

/// Gaussian noise model whose only free parameter is `log_sigma_obs`.
fn noise_only_model(y: &Array1<f64>, jacobian: bool) -> LatentGaussianModel {
    let priors = HyperPriorSet::new()
        .with("log_sigma_obs", HyperPrior::Flat)
        .expect("prior")
        .with_jacobian_correction(jacobian);
    LatentGaussianModel::builder(
        FieldStructure::Iid(BlockDiagonalPenalty::identity_blocks(&[1]).expect("iid")),
        Observations::gaussian(y.clone()).expect("obs"),
    )
    .link(LinkMap::from_triplets(y.len(), 1, &[]).expect("empty link"))
    .priors(priors)
    .hold("log_sigma_0", 0.0)
    .build()
    .expect("model")
}

#[test]
fn log_scale_jacobian_shifts_variance_estimate() {
    let y = Array1::from(vec![0.3, -1.1, 0.8, 2.0, -0.4, 0.9, -1.6, 0.2]);
    let n = y.len() as f64;
    let sum_sq = y.dot(&y);

    let with = fit_model(&noise_only_model(&y, true), &FitOptions::default()).expect("fit");
    let sigma2 = (2.0 * with.parameter("log_sigma_obs").expect("param")).exp();
    assert!((sigma2 - sum_sq / (n - 1.0)).abs() < 1e-4 * sigma2, "{sigma2}");

    let without = fit_model(&noise_only_model(&y, false), &FitOptions::default()).expect("fit");
    let sigma2 = (2.0 * without.parameter("log_sigma_obs").expect("param")).exp();
    assert!((sigma2 - sum_sq / n).abs() < 1e-4 * sigma2, "{sigma2}");
}

#[test]
fn held_parameters_stay_fixed_and_are_not_reported_as_free() {
    let y = Array1::from(vec![0.5, -0.5, 1.5]);
    let fit = fit_model(&noise_only_model(&y, true), &FitOptions::default()).expect("fit");
    assert_eq!(fit.free_parameters().len(), 1);
    assert_eq!(fit.parameter("log_sigma_0"), Some(0.0));
    let report = fit.report().expect("report");
    assert_eq!(report.parameter_names(), &["log_sigma_obs".to_string()]);
}
