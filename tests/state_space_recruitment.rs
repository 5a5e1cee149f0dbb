use approx::assert_abs_diff_eq;
use faer::Side;
use gmrf::linalg::faer_ndarray::FaerCholesky;
use gmrf::linalg::sparse_exact::sparse_to_dense;
use gmrf::probability::LN_2PI;
use gmrf::{
    FieldStructure, FitOptions, LatentGaussianModel, Observations, RecruitmentDynamics,
    StateSpaceStructure, fit_model,
};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Laplace value of the Gaussian random-walk model written out densely:
/// `c − ½bᵀH⁻¹b + ½log|H|` for `f(u) = ½uᵀHu − bᵀu + c`.
fn dense_random_walk_laplace(y: &Array1<f64>, log_sigma: f64, log_sigma_obs: f64) -> f64 {
    let n = y.len();
    let structure = StateSpaceStructure::random_walk(n).expect("rw");
    let q = sparse_to_dense(&structure.precision(log_sigma).expect("precision"));
    let inv_obs_var = (-2.0 * log_sigma_obs).exp();
    let h = &q + &(Array2::<f64>::eye(n) * inv_obs_var);
    let b = y * inv_obs_var;
    let logdet_q = (n as f64 - 1.0) * (-2.0 * log_sigma);
    let c = -0.5 * logdet_q
        + n as f64 * (0.5 * LN_2PI + log_sigma_obs)
        + 0.5 * y.dot(y) * inv_obs_var;
    let chol = h.cholesky(Side::Lower).expect("spd");
    let h_inv_b = chol.solve_vec(&b);
    c - 0.5 * b.dot(&h_inv_b) + 0.5 * chol.log_determinant()
}

fn random_walk_model(robs: &Array1<f64>) -> LatentGaussianModel {
    let log_r = robs.mapv(f64::ln);
    let structure =
        FieldStructure::StateSpace(StateSpaceStructure::random_walk(robs.len()).expect("rw"));
    LatentGaussianModel::builder(structure, Observations::gaussian(log_r).expect("obs"))
        .initial("log_sigma", -1.0)
        .initial("log_sigma_obs", -1.0)
        .build()
        .expect("model")
}

#[test]
fn random_walk_fit_matches_dense_marginal() {
    let robs = array![10.0, 12.0, 11.0, 15.0];
    let model = random_walk_model(&robs);
    let fit = fit_model(&model, &FitOptions::default()).expect("fit");

    let log_sigma = fit.parameter("log_sigma").expect("log_sigma");
    let log_sigma_obs = fit.parameter("log_sigma_obs").expect("log_sigma_obs");
    let dense = dense_random_walk_laplace(&robs.mapv(f64::ln), log_sigma, log_sigma_obs);
    assert_abs_diff_eq!(fit.value(), dense, epsilon = 1e-8);

    assert_abs_diff_eq!(log_sigma, -1.94794, epsilon = 5e-3);
    assert_abs_diff_eq!(log_sigma_obs, -2.21937, epsilon = 5e-3);
    assert_abs_diff_eq!(fit.value(), 0.410582, epsilon = 1e-4);

    // The optimum of the dense formula is not improved by nearby points.
    for (ds, dobs) in [(0.05, 0.0), (-0.05, 0.0), (0.0, 0.05), (0.0, -0.05)] {
        let nearby = dense_random_walk_laplace(
            &robs.mapv(f64::ln),
            log_sigma + ds,
            log_sigma_obs + dobs,
        );
        assert!(nearby >= fit.value() - 1e-9);
    }
}

#[test]
fn random_walk_report_has_natural_scale_errors() {
    let robs = array![10.0, 12.0, 11.0, 15.0];
    let fit = fit_model(&random_walk_model(&robs), &FitOptions::default()).expect("fit");
    let report = fit.report().expect("report");
    let raw = report.get("log_sigma_obs").expect("raw entry");
    let natural = report.get("sigma_obs").expect("natural entry");
    assert_abs_diff_eq!(natural.value, raw.value.exp(), epsilon = 1e-12);
    assert!(raw.std_error > 0.0 && raw.std_error.is_finite());
    assert_abs_diff_eq!(natural.std_error, natural.value * raw.std_error, epsilon = 1e-10);
    // Latent block first, then the two hyperparameters.
    assert_eq!(report.joint_precision().nrows(), 4 + 2);
    assert_eq!(report.parameter_names(), &["log_sigma".to_string(), "log_sigma_obs".to_string()]);
}

fn simulate_recruitment(
    dynamics: RecruitmentDynamics,
    alpha: f64,
    beta: f64,
    sigma: f64,
    years: usize,
    seed: u64,
) -> (Array1<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, sigma).expect("normal");
    let ssb: Array1<f64> = (0..years).map(|_| 5.0 + 35.0 * rng.random::<f64>()).collect();
    let mut log_r = Array1::<f64>::zeros(years);
    log_r[0] = 2.5;
    for t in 1..years {
        log_r[t] = dynamics.prediction(alpha, beta, ssb[t - 1]) + noise.sample(&mut rng);
    }
    (ssb, log_r)
}

#[test]
fn ricker_fit_recovers_stock_recruitment_coefficients() {
    let (alpha, beta) = (1.0, -3.0);
    let (ssb, log_r) = simulate_recruitment(RecruitmentDynamics::Ricker, alpha, beta, 0.3, 60, 11);
    let structure = FieldStructure::StateSpace(
        StateSpaceStructure::recruitment(RecruitmentDynamics::Ricker, ssb).expect("structure"),
    );
    let model = LatentGaussianModel::builder(structure, Observations::gaussian(log_r).expect("obs"))
        .initial("alpha", 0.5)
        .initial("beta", -2.0)
        .initial("log_sigma", -1.0)
        .hold("log_sigma_obs", 0.05_f64.ln())
        .build()
        .expect("model");
    let fit = fit_model(&model, &FitOptions::default()).expect("fit");
    assert!((fit.parameter("alpha").expect("alpha") - alpha).abs() < 0.4);
    assert!((fit.parameter("beta").expect("beta") - beta).abs() < 0.4);
    let sigma = fit.natural_parameter("log_sigma").expect("sigma");
    assert!(sigma > 0.15 && sigma < 0.5, "sigma = {sigma}");
}

#[test]
fn beverton_holt_fit_runs_to_a_finite_optimum() {
    let (ssb, log_r) =
        simulate_recruitment(RecruitmentDynamics::BevertonHolt, 1.0, -2.0, 0.25, 50, 5);
    let structure = FieldStructure::StateSpace(
        StateSpaceStructure::recruitment(RecruitmentDynamics::BevertonHolt, ssb)
            .expect("structure"),
    );
    let model = LatentGaussianModel::builder(structure, Observations::gaussian(log_r).expect("obs"))
        .initial("beta", -1.0)
        .hold("log_sigma_obs", 0.05_f64.ln())
        .build()
        .expect("model");
    let fit = fit_model(&model, &FitOptions::default()).expect("fit");
    assert!(fit.value().is_finite());
    assert!(fit.parameter("alpha").expect("alpha").is_finite());
}

#[test]
fn unknown_recruitment_code_fails_at_construction() {
    assert!(RecruitmentDynamics::from_code(3).is_err());
}
