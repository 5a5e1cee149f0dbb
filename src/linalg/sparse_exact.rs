use crate::estimate::EstimationError;
use crate::linalg::faer_ndarray::{array1_to_col_mat_mut, array2_to_mat_mut};
use dyn_stack::{MemBuffer, MemStack};
use faer::sparse::linalg::cholesky::supernodal::SupernodalLltRef;
use faer::sparse::linalg::cholesky::{
    LltRef, SymbolicCholesky, SymbolicCholeskyRaw, factorize_symbolic_cholesky,
};
use faer::sparse::{SparseColMat, Triplet};
use faer::{Conj, MatMut, Side, get_global_parallelism};
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const ZERO_TOL: f64 = 1e-12;

/// Sparse Cholesky factor of a symmetric positive-definite matrix together with
/// its log-determinant, read off the diagonal of `L`.
#[derive(Clone)]
pub struct SparseExactFactor {
    symbolic: Arc<SymbolicCholesky<usize>>,
    values: Vec<f64>,
    n: usize,
    logdet: f64,
}

impl SparseExactFactor {
    pub fn dim(&self) -> usize {
        self.n
    }
}

/// Entries keyed by `(col, row)` so iteration follows CSC order.
pub type SparseEntries = BTreeMap<(usize, usize), f64>;

pub fn sparse_from_entries(
    nrows: usize,
    ncols: usize,
    entries: &SparseEntries,
) -> Result<SparseColMat<usize, f64>, EstimationError> {
    let triplets: Vec<Triplet<usize, usize, f64>> = entries
        .iter()
        .map(|(&(col, row), &value)| Triplet::new(row, col, value))
        .collect();
    SparseColMat::try_new_from_triplets(nrows, ncols, &triplets).map_err(|_| {
        EstimationError::Structural(format!(
            "failed to assemble {nrows}x{ncols} sparse matrix from {} entries",
            entries.len()
        ))
    })
}

pub fn sparse_to_entries(matrix: &SparseColMat<usize, f64>) -> SparseEntries {
    let mut entries = SparseEntries::new();
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            *entries.entry((col, row_idx[idx])).or_insert(0.0) += values[idx];
        }
    }
    entries
}

pub fn dense_to_sparse(
    matrix: &Array2<f64>,
    tol: f64,
) -> Result<SparseColMat<usize, f64>, EstimationError> {
    let mut entries = SparseEntries::new();
    for row in 0..matrix.nrows() {
        for col in 0..matrix.ncols() {
            let value = matrix[[row, col]];
            if value.abs() > tol {
                entries.insert((col, row), value);
            }
        }
    }
    sparse_from_entries(matrix.nrows(), matrix.ncols(), &entries)
}

/// Densify a sparse matrix stored with both triangles.
pub fn sparse_to_dense(matrix: &SparseColMat<usize, f64>) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((matrix.nrows(), matrix.ncols()));
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            dense[[row_idx[idx], col]] += values[idx];
        }
    }
    dense
}

pub fn sparse_matvec(matrix: &SparseColMat<usize, f64>, vector: &Array1<f64>) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(matrix.nrows());
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        let x = vector[col];
        if x == 0.0 {
            continue;
        }
        for idx in col_ptr[col]..col_ptr[col + 1] {
            out[row_idx[idx]] += values[idx] * x;
        }
    }
    out
}

pub fn sparse_transpose_matvec(
    matrix: &SparseColMat<usize, f64>,
    vector: &Array1<f64>,
) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(matrix.ncols());
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        let mut acc = 0.0_f64;
        for idx in col_ptr[col]..col_ptr[col + 1] {
            acc += values[idx] * vector[row_idx[idx]];
        }
        out[col] = acc;
    }
    out
}

/// `vᵀ M v` in one pass over the stored entries.
pub fn sparse_quadratic_form(matrix: &SparseColMat<usize, f64>, vector: &Array1<f64>) -> f64 {
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    let mut quad = 0.0_f64;
    for col in 0..matrix.ncols() {
        let x = vector[col];
        if x == 0.0 {
            continue;
        }
        for idx in col_ptr[col]..col_ptr[col + 1] {
            quad += vector[row_idx[idx]] * values[idx] * x;
        }
    }
    quad
}

pub fn factorize_sparse_spd(
    h: &SparseColMat<usize, f64>,
    label: &str,
) -> Result<SparseExactFactor, EstimationError> {
    let singular = |reason: String| EstimationError::SingularPrecision {
        context: label.to_string(),
        reason,
    };
    let symbolic = factorize_symbolic_cholesky(
        h.symbolic(),
        Side::Lower,
        Default::default(),
        Default::default(),
    )
    .map_err(|e| singular(format!("symbolic Cholesky failed: {e:?}")))?;
    let par = get_global_parallelism();
    let mut values = vec![0.0_f64; symbolic.len_val()];
    let mut mem =
        MemBuffer::new(symbolic.factorize_numeric_llt_scratch::<f64>(par, Default::default()));
    symbolic
        .factorize_numeric_llt(
            values.as_mut_slice(),
            h.as_ref(),
            Side::Lower,
            Default::default(),
            par,
            MemStack::new(&mut mem),
            Default::default(),
        )
        .map_err(|e| singular(format!("sparse Cholesky failed: {e:?}")))?;
    let logdet = llt_log_determinant(&symbolic, &values);
    if !logdet.is_finite() {
        return Err(singular(format!("non-finite log-determinant {logdet}")));
    }
    Ok(SparseExactFactor {
        symbolic: Arc::new(symbolic),
        values,
        n: h.ncols(),
        logdet,
    })
}

/// `log|A| = 2 Σ log L_jj`; the fill-reducing permutation leaves it unchanged.
fn llt_log_determinant(symbolic: &SymbolicCholesky<usize>, values: &[f64]) -> f64 {
    let mut sum = 0.0_f64;
    match symbolic.raw() {
        SymbolicCholeskyRaw::Simplicial(simplicial) => {
            // Each column stores its diagonal entry first.
            let col_ptr = simplicial.col_ptr();
            for j in 0..col_ptr.len().saturating_sub(1) {
                sum += values[col_ptr[j]].ln();
            }
        }
        SymbolicCholeskyRaw::Supernodal(supernodal) => {
            let factor = SupernodalLltRef::new(supernodal, values);
            for s in 0..supernodal.n_supernodes() {
                let block = factor.supernode(s).val();
                for k in 0..block.ncols() {
                    sum += block[(k, k)].ln();
                }
            }
        }
    }
    2.0 * sum
}

fn solve_in_place(factor: &SparseExactFactor, rhs: MatMut<'_, f64>) {
    let par = get_global_parallelism();
    let mut mem = MemBuffer::new(factor.symbolic.solve_in_place_scratch::<f64>(rhs.ncols(), par));
    LltRef::new(factor.symbolic.as_ref(), factor.values.as_slice()).solve_in_place_with_conj(
        Conj::No,
        rhs,
        par,
        MemStack::new(&mut mem),
    );
}

pub fn solve_sparse_spd(
    factor: &SparseExactFactor,
    rhs: &Array1<f64>,
) -> Result<Array1<f64>, EstimationError> {
    if rhs.len() != factor.n {
        return Err(EstimationError::LinearSystemSolveFailed(format!(
            "right-hand side has length {} but the factor is {}x{}",
            rhs.len(),
            factor.n,
            factor.n
        )));
    }
    let mut result = rhs.to_owned();
    solve_in_place(factor, array1_to_col_mat_mut(&mut result));
    if result.iter().any(|v| !v.is_finite()) {
        return Err(EstimationError::LinearSystemSolveFailed(
            "sparse solve produced non-finite values".to_string(),
        ));
    }
    Ok(result)
}

pub fn solve_sparse_spd_multi(
    factor: &SparseExactFactor,
    rhs: &Array2<f64>,
) -> Result<Array2<f64>, EstimationError> {
    if rhs.nrows() != factor.n {
        return Err(EstimationError::LinearSystemSolveFailed(format!(
            "right-hand side has {} rows but the factor is {}x{}",
            rhs.nrows(),
            factor.n,
            factor.n
        )));
    }
    let mut result = rhs.as_standard_layout().into_owned();
    solve_in_place(factor, array2_to_mat_mut(&mut result));
    Ok(result)
}

pub fn logdet_from_factor(factor: &SparseExactFactor) -> f64 {
    factor.logdet
}
