use crate::probability::{cast, log1p_exp, sigmoid};
use num_traits::Float;

/// `−log N(y; η, σ²)` including `½log 2π`.
#[inline]
pub fn gaussian_neg_log_lik<T: Float>(eta: T, y: T, log_sigma: T) -> T {
    crate::probability::normal_neg_log_pdf(y, eta, log_sigma.exp())
}

#[inline]
pub fn gaussian_eta_derivatives<T: Float>(eta: T, y: T, log_sigma: T) -> (T, T) {
    let inv_var = (cast::<T>(-2.0) * log_sigma).exp();
    ((eta - y) * inv_var, inv_var)
}

/// `n·log(1+eᶯ) − y·η − log C(n, y)`; `ln_choose` is precomputed.
#[inline]
pub fn binomial_neg_log_lik<T: Float>(eta: T, y: T, trials: T, ln_choose: T) -> T {
    trials * log1p_exp(eta) - y * eta - ln_choose
}

#[inline]
pub fn binomial_eta_derivatives<T: Float>(eta: T, y: T, trials: T) -> (T, T) {
    let p = sigmoid(eta);
    (trials * p - y, trials * p * (T::one() - p))
}

/// `eᶯ − y·η + log y!`; `ln_factorial` is precomputed.
#[inline]
pub fn poisson_neg_log_lik<T: Float>(eta: T, y: T, ln_factorial: T) -> T {
    eta.exp() - y * eta + ln_factorial
}

#[inline]
pub fn poisson_eta_derivatives<T: Float>(eta: T, y: T) -> (T, T) {
    let mu = eta.exp();
    (mu - y, mu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probability::{LN_2PI, ln_binomial, ln_factorial};
    use approx::assert_abs_diff_eq;

    #[test]
    fn bernoulli_reduces_to_softplus_forms() {
        let eta = 0.8_f64;
        assert_abs_diff_eq!(
            binomial_neg_log_lik(eta, 1.0, 1.0, 0.0),
            (-eta).exp().ln_1p(),
            epsilon = 1e-14
        );
        assert_abs_diff_eq!(
            binomial_neg_log_lik(eta, 0.0, 1.0, 0.0),
            eta + (-eta).exp().ln_1p(),
            epsilon = 1e-14
        );
        // Stable far in the tails.
        assert!(binomial_neg_log_lik(800.0_f64, 1.0, 1.0, 0.0).is_finite());
        assert!(binomial_neg_log_lik(-800.0_f64, 0.0, 1.0, 0.0).abs() < 1e-300);
    }

    #[test]
    fn binomial_matches_direct_probability() {
        let (eta, y, n) = (-0.4_f64, 3.0, 7.0);
        let p = 1.0 / (1.0 + (-eta).exp());
        let direct = -(ln_binomial(n, y) + y * p.ln() + (n - y) * (1.0 - p).ln());
        assert_abs_diff_eq!(
            binomial_neg_log_lik(eta, y, n, ln_binomial(n, y)),
            direct,
            epsilon = 1e-12
        );
    }

    #[test]
    fn gaussian_and_poisson_constants() {
        assert_abs_diff_eq!(gaussian_neg_log_lik(1.0_f64, 1.0, 0.0), 0.5 * LN_2PI, epsilon = 1e-15);
        assert_abs_diff_eq!(
            poisson_neg_log_lik(0.0_f64, 2.0, ln_factorial(2.0)),
            1.0 + 2.0_f64.ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn derivatives_match_central_differences() {
        let h = 1e-5;
        let eta = 0.35_f64;
        let checks: Vec<(Box<dyn Fn(f64) -> f64>, (f64, f64))> = vec![
            (
                Box::new(|e: f64| gaussian_neg_log_lik(e, 1.3, -0.2)),
                gaussian_eta_derivatives(eta, 1.3, -0.2),
            ),
            (
                Box::new(|e: f64| binomial_neg_log_lik(e, 2.0, 5.0, 0.0)),
                binomial_eta_derivatives(eta, 2.0, 5.0),
            ),
            (
                Box::new(|e: f64| poisson_neg_log_lik(e, 4.0, 0.0)),
                poisson_eta_derivatives(eta, 4.0),
            ),
        ];
        for (f, (g, w)) in checks {
            let g_fd = (f(eta + h) - f(eta - h)) / (2.0 * h);
            let w_fd = (f(eta + h) - 2.0 * f(eta) + f(eta - h)) / (h * h);
            assert_abs_diff_eq!(g, g_fd, epsilon = 1e-6);
            assert_abs_diff_eq!(w, w_fd, epsilon = 1e-3);
        }
    }
}
