use gmrf::{
    DerivedQuantity, FieldStructure, FitOptions, LatentGaussianModel, Mesh2d, Observations,
    SpdeMatrices, fit_model,
};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn unit_square_mesh(k: usize) -> Mesh2d {
    let mut vertices = Vec::with_capacity(k * k);
    for j in 0..k {
        for i in 0..k {
            vertices.push([i as f64 / (k - 1) as f64, j as f64 / (k - 1) as f64]);
        }
    }
    let mut triangles = Vec::new();
    for j in 0..k - 1 {
        for i in 0..k - 1 {
            let v = j * k + i;
            triangles.push([v, v + 1, v + k + 1]);
            triangles.push([v, v + k + 1, v + k]);
        }
    }
    Mesh2d::new(vertices, triangles).expect("valid mesh")
}

struct SurvivalData {
    points: Vec<[f64; 2]>,
    times: Array1<f64>,
    events: Array1<u8>,
}

/// Weibull times with log-rate `β₀ + f(x, y)` and administrative censoring.
fn simulate(n: usize, intercept: f64, shape: f64, seed: u64) -> SurvivalData {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(n);
    let mut times = Array1::<f64>::zeros(n);
    let mut events = Array1::<u8>::zeros(n);
    let censor_at = 3.0;
    for i in 0..n {
        let p = [rng.random::<f64>(), rng.random::<f64>()];
        let effect = 0.8 * (2.0 * std::f64::consts::PI * p[0]).sin() * (std::f64::consts::PI * p[1]).cos();
        let rate = (intercept + effect).exp();
        let u: f64 = rng.random::<f64>().max(1e-12);
        let t = (-u.ln() / rate).powf(1.0 / shape);
        if t < censor_at {
            times[i] = t;
            events[i] = 1;
        } else {
            times[i] = censor_at;
        }
        points.push(p);
    }
    SurvivalData {
        points,
        times,
        events,
    }
}

#[test]
fn spatial_weibull_fit_recovers_shape_and_reports_field_summaries() {
    let mesh = unit_square_mesh(6);
    let data = simulate(300, -0.5, 1.5, 2024);
    let projector = mesh.projector(&data.points).expect("projector");
    let structure = FieldStructure::Spde(SpdeMatrices::from_mesh_2d(&mesh).expect("spde"));
    let model = LatentGaussianModel::builder(
        structure,
        Observations::weibull(data.times.clone(), data.events.clone()).expect("obs"),
    )
    .link(projector)
    .design(Array2::ones((300, 1)))
    .initial("log_kappa", 1.0)
    .build()
    .expect("model");

    let fit = fit_model(&model, &FitOptions::default()).expect("fit");
    let shape = fit.natural_parameter("log_shape").expect("shape");
    assert!(shape > 1.2 && shape < 1.8, "shape = {shape}");
    let intercept = fit.parameter("beta_0").expect("intercept");
    assert!((intercept + 0.5).abs() < 0.4, "intercept = {intercept}");

    // Estimated field at a location where the true effect is strongly positive.
    let at_peak = mesh.projector(&[[0.2, 0.0]]).expect("projector");
    let weights = at_peak.apply_transpose(&Array1::ones(1));
    let log_tau = model.layout().index_of("log_tau").expect("log_tau");
    let field_at_peak = DerivedQuantity::custom("field_at_peak", move |theta, latent| {
        weights.dot(latent) / theta[log_tau].exp()
    });
    let report = fit.report_with(&[field_at_peak]).expect("report");
    for name in ["range", "marginal_sd", "shape", "field_at_peak"] {
        let entry = report.get(name).expect("entry");
        assert!(entry.value.is_finite(), "{name} not finite");
        assert!(entry.std_error.is_finite() && entry.std_error >= 0.0);
    }
    let range = report.get("range").expect("range");
    let kappa = fit.natural_parameter("log_kappa").expect("kappa");
    assert!((range.value - 8.0_f64.sqrt() / kappa).abs() < 1e-10);
}

#[test]
fn censoring_indicator_changes_the_likelihood() {
    let obs_event =
        Observations::weibull(Array1::from(vec![1.0]), Array1::from(vec![1u8])).expect("obs");
    let obs_censored =
        Observations::weibull(Array1::from(vec![1.0]), Array1::from(vec![0u8])).expect("obs");
    let eta = Array1::from(vec![0.0]);
    let log_shape = [2.0_f64.ln()];
    let censored = obs_censored.neg_log_likelihood(&eta, &log_shape).expect("nll");
    let event = obs_event.neg_log_likelihood(&eta, &log_shape).expect("nll");
    assert!((censored - 1.0).abs() < 1e-12);
    assert!((event - 0.3069).abs() < 1e-4);
}
