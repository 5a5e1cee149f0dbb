use num_traits::Float;

/// `ln(2π)`.
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

#[inline]
pub(crate) fn cast<T: Float>(value: f64) -> T {
    T::from(value).unwrap_or_else(T::nan)
}

/// Numerically stable `ln(1 + eˣ)`.
#[inline]
pub fn log1p_exp<T: Float>(x: T) -> T {
    if x > T::zero() {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Logistic function `1 / (1 + e⁻ˣ)` without overflow for large |x|.
#[inline]
pub fn sigmoid<T: Float>(x: T) -> T {
    if x >= T::zero() {
        T::one() / (T::one() + (-x).exp())
    } else {
        let e = x.exp();
        e / (T::one() + e)
    }
}

/// `-ln N(y; mean, sd²)` including the `½ln(2π)` constant.
#[inline]
pub fn normal_neg_log_pdf<T: Float>(y: T, mean: T, sd: T) -> T {
    let z = (y - mean) / sd;
    let half = cast::<T>(0.5);
    half * cast::<T>(LN_2PI) + sd.ln() + half * z * z
}

/// `ln Γ(x + 1)` for non-negative counts.
#[inline]
pub fn ln_factorial(x: f64) -> f64 {
    statrs::function::gamma::ln_gamma(x + 1.0)
}

/// `ln C(n, k)` for real-valued `0 ≤ k ≤ n`.
#[inline]
pub fn ln_binomial(n: f64, k: f64) -> f64 {
    ln_factorial(n) - ln_factorial(k) - ln_factorial(n - k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log1p_exp_is_stable_in_both_tails() {
        assert!((log1p_exp(800.0_f64) - 800.0).abs() < 1e-12);
        assert!(log1p_exp(-800.0_f64) >= 0.0);
        assert!(log1p_exp(-800.0_f64) < 1e-300);
        assert!((log1p_exp(0.0_f64) - 2.0_f64.ln()).abs() < 1e-15);
    }

    #[test]
    fn sigmoid_matches_definition_and_saturates() {
        assert!((sigmoid(0.3_f64) - 1.0 / (1.0 + (-0.3_f64).exp())).abs() < 1e-15);
        assert_eq!(sigmoid(-1000.0_f64), 0.0);
        assert_eq!(sigmoid(1000.0_f64), 1.0);
    }

    #[test]
    fn normal_kernel_matches_closed_form() {
        let v = normal_neg_log_pdf(1.0_f64, 0.0, 2.0);
        let expected = 0.5 * LN_2PI + 2.0_f64.ln() + 0.125;
        assert!((v - expected).abs() < 1e-14);
        let single = normal_neg_log_pdf(1.0_f32, 0.0, 2.0);
        assert!((f64::from(single) - expected).abs() < 1e-5);
    }

    #[test]
    fn ln_binomial_matches_small_table() {
        assert!((ln_binomial(5.0, 2.0) - 10.0_f64.ln()).abs() < 1e-10);
        assert!(ln_binomial(3.0, 0.0).abs() < 1e-10);
    }
}
