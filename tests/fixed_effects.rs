use gmrf::{
    BlockDiagonalPenalty, FieldStructure, FitOptions, LatentGaussianModel, LinkMap, Observations,
    fit_model,
};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

const GROUPS: usize = 4;
const PER_GROUP: usize = 10;

fn grouped_gaussian(level: f64) -> LatentGaussianModel {
    let effects = [-1.0, 0.5, 1.2, -0.7];
    let noise = Normal::new(0.0, 0.5).expect("normal");
    let mut rng = StdRng::seed_from_u64(17);
    let mut response = Vec::new();
    let mut groups = Vec::new();
    for (g, effect) in effects.iter().enumerate() {
        for _ in 0..PER_GROUP {
            response.push(level + effect + noise.sample(&mut rng));
            groups.push(g);
        }
    }
    let n = response.len();
    LatentGaussianModel::builder(
        FieldStructure::Iid(BlockDiagonalPenalty::identity_blocks(&[GROUPS]).expect("iid")),
        Observations::gaussian(Array1::from(response)).expect("obs"),
    )
    .link(LinkMap::indexed(&groups, GROUPS).expect("link"))
    .design(Array2::ones((n, 1)))
    .build()
    .expect("model")
}

#[test]
fn intercept_far_outside_the_log_scale_box_is_recovered() {
    let fit = fit_model(&grouped_gaussian(100.0), &FitOptions::default()).expect("fit");
    let intercept = fit.parameter("beta_0").expect("intercept");
    assert!((intercept - 100.0).abs() < 1.0, "intercept {intercept}");
    assert!(fit.value().is_finite());
}

#[test]
fn negative_intercept_beyond_the_box_is_recovered() {
    let fit = fit_model(&grouped_gaussian(-60.0), &FitOptions::default()).expect("fit");
    let intercept = fit.parameter("beta_0").expect("intercept");
    assert!((intercept + 60.0).abs() < 1.0, "intercept {intercept}");
}

#[test]
fn only_log_scale_parameters_are_boxed() {
    let model = grouped_gaussian(0.0);
    let bounds = model.free_bounds(30.0);
    let names: Vec<String> = model
        .free_indices()
        .iter()
        .map(|&i| model.layout().specs()[i].name.clone())
        .collect();
    for (slot, name) in names.iter().enumerate() {
        if name.starts_with("beta_") {
            assert!(bounds.lower[slot].is_infinite() && bounds.upper[slot].is_infinite());
        } else {
            assert_eq!((bounds.lower[slot], bounds.upper[slot]), (-30.0, 30.0), "{name}");
        }
    }
    assert!(names.iter().any(|name| name == "beta_0"));
}
