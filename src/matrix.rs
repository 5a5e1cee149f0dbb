use crate::estimate::EstimationError;
use crate::linalg::sparse_exact::{
    SparseEntries, sparse_from_entries, sparse_matvec, sparse_transpose_matvec,
};
use faer::sparse::{SparseColMat, SparseRowMat};
use ndarray::{Array1, Array2};
use std::sync::{Arc, OnceLock};

#[inline]
pub(crate) fn dense_matvec(matrix: &Array2<f64>, vector: &Array1<f64>) -> Array1<f64> {
    let nrows = matrix.nrows();
    let ncols = matrix.ncols();
    let mut out = Array1::<f64>::zeros(nrows);

    if ncols == 0 || nrows == 0 {
        return out;
    }

    if matrix.is_standard_layout()
        && let (Some(ms), Some(vs), Some(os)) = (
            matrix.as_slice_memory_order(),
            vector.as_slice(),
            out.as_slice_mut(),
        )
    {
        for (i, row) in ms.chunks_exact(ncols).enumerate() {
            let mut acc = 0.0_f64;
            for j in 0..ncols {
                acc += row[j] * vs[j];
            }
            os[i] = acc;
        }
        return out;
    }

    for i in 0..nrows {
        let mut acc = 0.0_f64;
        for j in 0..ncols {
            acc += matrix[[i, j]] * vector[j];
        }
        out[i] = acc;
    }
    out
}

/// Fixed sparse map from latent-field indices to per-observation contributions.
///
/// Stored column-major; a row-major copy is built lazily the first time a
/// row-wise product is needed and shared between clones.
#[derive(Clone)]
pub struct LinkMap {
    matrix: SparseColMat<usize, f64>,
    csr_cache: Arc<OnceLock<Arc<SparseRowMat<usize, f64>>>>,
}

impl LinkMap {
    pub fn new(matrix: SparseColMat<usize, f64>) -> Result<Self, EstimationError> {
        if matrix.val().iter().any(|v| !v.is_finite()) {
            return Err(EstimationError::Structural(
                "link map contains non-finite weights".to_string(),
            ));
        }
        Ok(Self {
            matrix,
            csr_cache: Arc::new(OnceLock::new()),
        })
    }

    pub fn identity(n: usize) -> Result<Self, EstimationError> {
        let entries: SparseEntries = (0..n).map(|i| ((i, i), 1.0)).collect();
        Self::new(sparse_from_entries(n, n, &entries)?)
    }

    /// Row `i` selects latent element `indices[i]` with weight one.
    pub fn indexed(indices: &[usize], n_latent: usize) -> Result<Self, EstimationError> {
        let mut entries = SparseEntries::new();
        for (row, &col) in indices.iter().enumerate() {
            if col >= n_latent {
                return Err(EstimationError::Structural(format!(
                    "observation {row} refers to latent index {col} but the field has {n_latent} elements"
                )));
            }
            entries.insert((col, row), 1.0);
        }
        Self::new(sparse_from_entries(indices.len(), n_latent, &entries)?)
    }

    /// Build from `(row, col, weight)` triplets; repeated positions are summed.
    pub fn from_triplets(
        n_obs: usize,
        n_latent: usize,
        triplets: &[(usize, usize, f64)],
    ) -> Result<Self, EstimationError> {
        let mut entries = SparseEntries::new();
        for &(row, col, weight) in triplets {
            if row >= n_obs || col >= n_latent {
                return Err(EstimationError::Structural(format!(
                    "link entry ({row}, {col}) outside {n_obs}x{n_latent}"
                )));
            }
            *entries.entry((col, row)).or_insert(0.0) += weight;
        }
        Self::new(sparse_from_entries(n_obs, n_latent, &entries)?)
    }

    pub fn from_dense(matrix: &Array2<f64>) -> Result<Self, EstimationError> {
        let mut entries = SparseEntries::new();
        for row in 0..matrix.nrows() {
            for col in 0..matrix.ncols() {
                let v = matrix[[row, col]];
                if v != 0.0 {
                    entries.insert((col, row), v);
                }
            }
        }
        Self::new(sparse_from_entries(matrix.nrows(), matrix.ncols(), &entries)?)
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn nnz(&self) -> usize {
        self.matrix.val().len()
    }

    pub fn matrix(&self) -> &SparseColMat<usize, f64> {
        &self.matrix
    }

    fn to_csr_arc(&self) -> Result<Arc<SparseRowMat<usize, f64>>, EstimationError> {
        if let Some(cached) = self.csr_cache.get() {
            return Ok(cached.clone());
        }
        let csr = self.matrix.as_ref().to_row_major().map_err(|_| {
            EstimationError::Structural("failed to build CSR cache for link map".to_string())
        })?;
        let arc = Arc::new(csr);
        let _ = self.csr_cache.set(arc.clone());
        Ok(arc)
    }

    /// `A·v`
    pub fn apply(&self, latent: &Array1<f64>) -> Array1<f64> {
        sparse_matvec(&self.matrix, latent)
    }

    /// `Aᵀ·v`
    pub fn apply_transpose(&self, values: &Array1<f64>) -> Array1<f64> {
        sparse_transpose_matvec(&self.matrix, values)
    }

    /// Entries of `scale²·Aᵀ diag(weights) A`, keyed `(col, row)`.
    pub fn weighted_gram(
        &self,
        weights: &Array1<f64>,
        scale: f64,
    ) -> Result<SparseEntries, EstimationError> {
        let csr = self.to_csr_arc()?;
        let symbolic = csr.symbolic();
        let row_ptr = symbolic.row_ptr();
        let col_idx = symbolic.col_idx();
        let values = csr.val();
        let s2 = scale * scale;
        let mut entries = SparseEntries::new();
        for row in 0..csr.nrows() {
            let w = weights[row] * s2;
            if w == 0.0 {
                continue;
            }
            let start = row_ptr[row];
            let end = row_ptr[row + 1];
            for a in start..end {
                for b in start..end {
                    *entries.entry((col_idx[a], col_idx[b])).or_insert(0.0) +=
                        w * values[a] * values[b];
                }
            }
        }
        Ok(entries)
    }

    pub fn row_sums(&self) -> Array1<f64> {
        self.apply(&Array1::ones(self.ncols()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn dense_matvec_matches_ndarray_dot() {
        let x = array![[1.0, 2.0, -1.0], [0.5, -3.0, 4.0], [2.0, 0.0, 1.5]];
        let v = array![0.25, -1.0, 2.0];
        let expected = x.dot(&v);
        let got = dense_matvec(&x, &v);
        for i in 0..expected.len() {
            assert!((expected[i] - got[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn link_products_match_dense_multiplication() {
        let dense = array![[0.2, 0.8, 0.0], [0.0, 0.5, 0.5], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let link = LinkMap::from_dense(&dense).expect("link");
        assert_eq!(link.nnz(), 6);
        let u = array![1.0, -2.0, 3.0];
        let got = link.apply(&u);
        let expected = dense.dot(&u);
        for i in 0..4 {
            assert!((got[i] - expected[i]).abs() < 1e-14);
        }
        let r = array![1.0, 2.0, -1.0, 0.5];
        let got_t = link.apply_transpose(&r);
        let expected_t = dense.t().dot(&r);
        for j in 0..3 {
            assert!((got_t[j] - expected_t[j]).abs() < 1e-14);
        }
        for s in link.row_sums().iter() {
            assert!((s - 1.0).abs() < 1e-14);
        }
    }

    #[test]
    fn weighted_gram_matches_dense_form() {
        let dense = array![[0.2, 0.8, 0.0], [0.0, 0.5, 0.5], [1.0, 0.0, 0.0]];
        let link = LinkMap::from_dense(&dense).expect("link");
        let w = array![2.0, 1.0, 3.0];
        let entries = link.weighted_gram(&w, 0.5).expect("gram");
        let mut expected = Array2::<f64>::zeros((3, 3));
        for i in 0..3 {
            for a in 0..3 {
                for b in 0..3 {
                    expected[[a, b]] += 0.25 * w[i] * dense[[i, a]] * dense[[i, b]];
                }
            }
        }
        for a in 0..3 {
            for b in 0..3 {
                let got = entries.get(&(b, a)).copied().unwrap_or(0.0);
                assert!((got - expected[[a, b]]).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn indexed_link_rejects_out_of_range_latent() {
        assert!(LinkMap::indexed(&[0, 1, 5], 3).is_err());
        let link = LinkMap::indexed(&[2, 0, 2], 3).expect("valid indices");
        let got = link.apply(&array![10.0, 20.0, 30.0]);
        assert_eq!(got.to_vec(), vec![30.0, 10.0, 30.0]);
    }
}
