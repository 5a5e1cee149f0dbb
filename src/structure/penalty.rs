use crate::estimate::EstimationError;
use crate::linalg::faer_ndarray::FaerEigh;
use crate::linalg::sparse_exact::{SparseEntries, sparse_from_entries};
use faer::Side;
use faer::sparse::SparseColMat;
use ndarray::Array2;

const SYMMETRY_TOL: f64 = 1e-10;
const RANK_TOL: f64 = 1e-9;

/// One penalty block and where it sits on the latent vector.
#[derive(Clone, Debug)]
struct PenaltyBlock {
    matrix: Array2<f64>,
    offset: usize,
    rank: usize,
    /// `Σ ln μ` over the positive eigenvalues `μ`.
    log_pdet: f64,
}

/// `blockdiag(S₁, …, Sₖ)` stored as separate dense blocks.
///
/// The assembled precision `blockdiag(λ₁S₁, …, λₖSₖ)` lives on a fixed sparse
/// pattern made of each block's nonzeros plus the full diagonal, so no
/// inter-block zero is ever materialized.
#[derive(Clone)]
pub struct BlockDiagonalPenalty {
    blocks: Vec<PenaltyBlock>,
    dim: usize,
    template: SparseColMat<usize, f64>,
    /// For each stored entry of `template`: owning block and unscaled value.
    slots: Vec<(usize, f64)>,
}

impl BlockDiagonalPenalty {
    pub fn new(blocks: Vec<Array2<f64>>) -> Result<Self, EstimationError> {
        if blocks.is_empty() {
            return Err(EstimationError::Structural(
                "penalty needs at least one block".to_string(),
            ));
        }
        let mut stored = Vec::with_capacity(blocks.len());
        let mut offset = 0usize;
        for (b, matrix) in blocks.into_iter().enumerate() {
            let (rank, log_pdet) = validate_block(b, &matrix)?;
            let size = matrix.nrows();
            stored.push(PenaltyBlock {
                matrix,
                offset,
                rank,
                log_pdet,
            });
            offset += size;
        }
        let dim = offset;

        let mut entries = SparseEntries::new();
        let mut owner = std::collections::BTreeMap::new();
        for (b, block) in stored.iter().enumerate() {
            let m = block.matrix.nrows();
            for i in 0..m {
                for j in 0..m {
                    let v = block.matrix[[i, j]];
                    if v != 0.0 || i == j {
                        let key = (block.offset + j, block.offset + i);
                        entries.insert(key, 0.0);
                        owner.insert(key, (b, v));
                    }
                }
            }
        }
        let template = sparse_from_entries(dim, dim, &entries)?;
        // BTreeMap iteration is (col, row) order, the same as CSC storage.
        let slots: Vec<(usize, f64)> = owner.into_values().collect();
        debug_assert_eq!(slots.len(), template.val().len());

        Ok(Self {
            blocks: stored,
            dim,
            template,
            slots,
        })
    }

    /// Identity blocks of the given sizes; with `λᵢ = σᵢ⁻²` these are IID
    /// random-effect precisions.
    pub fn identity_blocks(sizes: &[usize]) -> Result<Self, EstimationError> {
        if let Some(b) = sizes.iter().position(|&m| m == 0) {
            return Err(EstimationError::Structural(format!(
                "random-effect block {b} has no levels"
            )));
        }
        Self::new(sizes.iter().map(|&m| Array2::eye(m)).collect())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, index: usize) -> Option<&Array2<f64>> {
        self.blocks.get(index).map(|b| &b.matrix)
    }

    pub fn block_offset(&self, index: usize) -> Option<usize> {
        self.blocks.get(index).map(|b| b.offset)
    }

    pub fn block_size(&self, index: usize) -> Option<usize> {
        self.blocks.get(index).map(|b| b.matrix.nrows())
    }

    pub fn block_rank(&self, index: usize) -> Option<usize> {
        self.blocks.get(index).map(|b| b.rank)
    }

    pub fn total_rank(&self) -> usize {
        self.blocks.iter().map(|b| b.rank).sum()
    }

    /// `blockdiag(λ₁S₁, …, λₖSₖ)`; `lambdas` must have one entry per block.
    pub fn assemble(&self, lambdas: &[f64]) -> Result<SparseColMat<usize, f64>, EstimationError> {
        if lambdas.len() != self.blocks.len() {
            return Err(EstimationError::Configuration(format!(
                "expected {} smoothing parameters, got {}",
                self.blocks.len(),
                lambdas.len()
            )));
        }
        let mut q = self.template.clone();
        let (_, values) = q.parts_mut();
        for (v, &(b, s)) in values.iter_mut().zip(&self.slots) {
            *v = lambdas[b] * s;
        }
        Ok(q)
    }

    /// Generalized log-determinant `Σ rankᵢ·ln λᵢ + Σ ln μ` of the assembled
    /// matrix, given `ln λᵢ`.
    pub fn log_pdet(&self, log_lambdas: &[f64]) -> f64 {
        self.blocks
            .iter()
            .zip(log_lambdas)
            .map(|(b, &log_lambda)| b.rank as f64 * log_lambda + b.log_pdet)
            .sum()
    }
}

fn validate_block(index: usize, matrix: &Array2<f64>) -> Result<(usize, f64), EstimationError> {
    let (rows, cols) = matrix.dim();
    if rows == 0 || rows != cols {
        return Err(EstimationError::Structural(format!(
            "penalty block {index} must be square and non-empty, got {rows}x{cols}"
        )));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(EstimationError::Structural(format!(
            "penalty block {index} contains non-finite entries"
        )));
    }
    for i in 0..rows {
        for j in (i + 1)..rows {
            let (a, b) = (matrix[[i, j]], matrix[[j, i]]);
            if (a - b).abs() > SYMMETRY_TOL * a.abs().max(b.abs()).max(1.0) {
                return Err(EstimationError::Structural(format!(
                    "penalty block {index} is not symmetric at ({i}, {j})"
                )));
            }
        }
    }
    let (eigenvalues, _) = matrix
        .eigh(Side::Lower)
        .map_err(EstimationError::EigendecompositionFailed)?;
    let max_eig = eigenvalues.iter().copied().fold(0.0_f64, f64::max);
    let tol = RANK_TOL * max_eig.max(1.0);
    if let Some(&neg) = eigenvalues.iter().find(|&&mu| mu < -tol) {
        return Err(EstimationError::Structural(format!(
            "penalty block {index} is not positive semidefinite (eigenvalue {neg:.3e})"
        )));
    }
    let positive: Vec<f64> = eigenvalues.iter().copied().filter(|&mu| mu > tol).collect();
    Ok((positive.len(), positive.iter().map(|mu| mu.ln()).sum()))
}
