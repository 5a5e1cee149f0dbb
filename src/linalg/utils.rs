use crate::linalg::faer_ndarray::FaerCholesky;
use faer::Side;
use ndarray::Array2;

const MAX_FACTORIZATION_ATTEMPTS: usize = 8;

#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

pub(crate) fn max_abs_diag(matrix: &Array2<f64>) -> f64 {
    matrix
        .diag()
        .iter()
        .copied()
        .map(f64::abs)
        .fold(0.0, f64::max)
        .max(1.0)
}

pub(crate) fn add_ridge(matrix: &Array2<f64>, ridge: f64) -> Array2<f64> {
    if ridge <= 0.0 {
        return matrix.clone();
    }
    let mut regularized = matrix.clone();
    let n = regularized.nrows();
    for i in 0..n {
        regularized[[i, i]] += ridge;
    }
    regularized
}

pub(crate) fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
}

/// Inverse of a symmetric matrix, adding a growing diagonal ridge until the
/// Cholesky factorization succeeds. Returns the inverse and the ridge used.
pub(crate) fn matrix_inverse_with_regularization(
    matrix: &Array2<f64>,
    label: &str,
) -> Option<(Array2<f64>, f64)> {
    let p = matrix.nrows();
    if p == 0 || matrix.ncols() != p {
        return None;
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        log::warn!("Refusing to invert {label}: matrix has non-finite entries");
        return None;
    }

    let scale = max_abs_diag(matrix);
    let mut ridge = 0.0_f64;
    for attempt in 0..MAX_FACTORIZATION_ATTEMPTS {
        let h_eff = add_ridge(matrix, ridge);
        if let Ok(chol) = h_eff.cholesky(Side::Lower) {
            if ridge > 0.0 {
                log::warn!(
                    "{} required ridge {:.3e} (attempt {}) before inversion",
                    label,
                    ridge,
                    attempt
                );
            }
            let mut inv = chol.solve_mat(&Array2::<f64>::eye(p));
            // Numerical solves can leave tiny asymmetry.
            symmetrize(&mut inv);
            return Some((inv, ridge));
        }
        ridge = if ridge == 0.0 {
            1e-10 * scale
        } else {
            ridge * 100.0
        };
    }
    log::warn!("Failed to factorize {} for covariance", label);
    None
}
