//! Right-censored Weibull proportional-hazards likelihood.
//!
//! With rate `λ = e^η` and shape `ω`, the cumulative hazard is `H(t) = λtʷ`.
//! An observed event contributes `−log f(t)`, a censored one `−log S(t)`.

use num_traits::Float;

/// `−log L` for one observation; `log_t` is the precomputed `ln t`.
#[inline]
pub fn weibull_neg_log_lik<T: Float>(eta: T, log_shape: T, log_t: T, event: bool) -> T {
    let shape = log_shape.exp();
    let cumulative_hazard = (eta + shape * log_t).exp();
    if event {
        let log_hazard = eta + log_shape + (shape - T::one()) * log_t;
        cumulative_hazard - log_hazard
    } else {
        cumulative_hazard
    }
}

/// First and second derivatives of [`weibull_neg_log_lik`] with respect to `η`.
#[inline]
pub fn weibull_eta_derivatives<T: Float>(eta: T, log_shape: T, log_t: T, event: bool) -> (T, T) {
    let cumulative_hazard = (eta + log_shape.exp() * log_t).exp();
    let delta = if event { T::one() } else { T::zero() };
    (cumulative_hazard - delta, cumulative_hazard)
}
