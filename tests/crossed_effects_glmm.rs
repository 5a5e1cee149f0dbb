use gmrf::{
    BlockDiagonalPenalty, FieldStructure, FitOptions, LatentGaussianModel, LinkMap, Observations,
    fit_models,
};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};

const N_A: usize = 10;
const N_B: usize = 8;
const REPS: usize = 3;

/// Evenly spread standardized effects with unit sample scale.
fn spread(levels: usize, sd: f64) -> Vec<f64> {
    (0..levels)
        .map(|i| sd * 1.6 * ((i as f64 + 0.5) / levels as f64 - 0.5) * 2.0)
        .collect()
}

struct Design {
    counts: Array1<f64>,
    rows: Vec<(usize, usize)>,
}

fn simulate() -> Design {
    let a = spread(N_A, 0.6);
    let mut b = spread(N_B, 0.7);
    b.reverse();
    let mut rng = StdRng::seed_from_u64(99);
    let mut counts = Vec::new();
    let mut rows = Vec::new();
    for i in 0..N_A {
        for j in 0..N_B {
            for _ in 0..REPS {
                let mean = (1.0 + a[i] + b[j]).exp();
                let draw: f64 = Poisson::new(mean).expect("poisson").sample(&mut rng);
                counts.push(draw);
                rows.push((i, j));
            }
        }
    }
    Design {
        counts: Array1::from(counts),
        rows,
    }
}

fn crossed_model(data: &Design, include_b: bool) -> LatentGaussianModel {
    let n = data.rows.len();
    let (sizes, triplets): (Vec<usize>, Vec<(usize, usize, f64)>) = if include_b {
        (
            vec![N_A, N_B],
            data.rows
                .iter()
                .enumerate()
                .flat_map(|(row, &(i, j))| [(row, i, 1.0), (row, N_A + j, 1.0)])
                .collect(),
        )
    } else {
        (
            vec![N_A],
            data.rows
                .iter()
                .enumerate()
                .map(|(row, &(i, _))| (row, i, 1.0))
                .collect(),
        )
    };
    let n_latent = sizes.iter().sum();
    LatentGaussianModel::builder(
        FieldStructure::Iid(BlockDiagonalPenalty::identity_blocks(&sizes).expect("iid")),
        Observations::poisson(data.counts.clone()).expect("obs"),
    )
    .link(LinkMap::from_triplets(n, n_latent, &triplets).expect("link"))
    .design(Array2::ones((n, 1)))
    .build()
    .expect("model")
}

#[test]
fn crossed_poisson_effects_are_recovered_and_preferred_by_aic() {
    let data = simulate();
    let models = vec![crossed_model(&data, true), crossed_model(&data, false)];
    let fits = fit_models(&models, &FitOptions::default());
    assert_eq!(fits.len(), 2);
    let full = fits[0].as_ref().expect("full fit");
    let reduced = fits[1].as_ref().expect("reduced fit");

    let sigma_a = full.natural_parameter("log_sigma_0").expect("sigma_a");
    let sigma_b = full.natural_parameter("log_sigma_1").expect("sigma_b");
    assert!(sigma_a > 0.25 && sigma_a < 1.2, "sigma_a = {sigma_a}");
    assert!(sigma_b > 0.3 && sigma_b < 1.4, "sigma_b = {sigma_b}");
    let intercept = full.parameter("beta_0").expect("intercept");
    assert!((intercept - 1.0).abs() < 0.5, "intercept = {intercept}");

    assert!(full.aic() < reduced.aic(), "{} vs {}", full.aic(), reduced.aic());
    assert!((full.aic() - (2.0 * full.value() + 6.0)).abs() < 1e-9);
}

#[test]
fn crossed_effects_report_covers_every_free_parameter() {
    let data = simulate();
    let fit = fit_models(&[crossed_model(&data, true)], &FitOptions::default())
        .pop()
        .expect("one result")
        .expect("fit");
    let report = fit.report().expect("report");
    for name in ["log_sigma_0", "log_sigma_1", "beta_0", "sigma_0", "sigma_1"] {
        let entry = report.get(name).unwrap_or_else(|| panic!("missing {name}"));
        assert!(entry.std_error.is_finite() && entry.std_error > 0.0, "{name}");
    }
    let covariance = report.joint_covariance().expect("covariance");
    let dim = N_A + N_B + 3;
    assert_eq!(covariance.nrows(), dim);

    let slot = report
        .parameter_names()
        .iter()
        .position(|name| name == "beta_0")
        .expect("beta_0 is free");
    let mut direction = Array1::<f64>::zeros(dim);
    direction[N_A + N_B + slot] = 1.0;
    let variance = report.joint_variance(&direction).expect("variance");
    let se = report.get("beta_0").expect("beta_0").std_error;
    assert!((variance.sqrt() - se).abs() < 1e-6 * se.max(1.0), "{} vs {se}", variance.sqrt());
    assert!((covariance[[N_A + N_B + slot, N_A + N_B + slot]] - variance).abs() < 1e-9);
}
