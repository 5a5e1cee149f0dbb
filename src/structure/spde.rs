//! Finite-element matrices for the order-2 SPDE (Matérn) precision
//! `Q(κ) = κ⁴·C + 2κ²·G1 + G2`.

use crate::estimate::EstimationError;
use crate::linalg::sparse_exact::{SparseEntries, sparse_from_entries, sparse_to_entries};
use crate::structure::mesh::{Mesh1d, Mesh2d};
use faer::sparse::SparseColMat;
use std::collections::BTreeSet;

const SYMMETRY_TOL: f64 = 1e-10;

/// Hyperparameter-independent SPDE building blocks on a fixed mesh.
///
/// `C` is the lumped (diagonal) mass matrix, `G1` the stiffness matrix and
/// `G2 = G1·C⁻¹·G1`. All three are stored on their own patterns and, for
/// assembly, as value vectors aligned to the union pattern.
#[derive(Clone)]
pub struct SpdeMatrices {
    spatial_dim: usize,
    c: SparseColMat<usize, f64>,
    g1: SparseColMat<usize, f64>,
    g2: SparseColMat<usize, f64>,
    template: SparseColMat<usize, f64>,
    c_vals: Vec<f64>,
    g1_vals: Vec<f64>,
    g2_vals: Vec<f64>,
}

impl SpdeMatrices {
    pub fn from_mesh_1d(mesh: &Mesh1d) -> Result<Self, EstimationError> {
        let nodes = mesh.nodes();
        let n = nodes.len();
        let mut c0 = vec![0.0; n];
        let mut g1 = SparseEntries::new();
        for i in 0..n - 1 {
            let h = nodes[i + 1] - nodes[i];
            c0[i] += 0.5 * h;
            c0[i + 1] += 0.5 * h;
            let k = 1.0 / h;
            *g1.entry((i, i)).or_insert(0.0) += k;
            *g1.entry((i + 1, i + 1)).or_insert(0.0) += k;
            *g1.entry((i + 1, i)).or_insert(0.0) -= k;
            *g1.entry((i, i + 1)).or_insert(0.0) -= k;
        }
        Self::from_lumped(1, n, &c0, g1)
    }

    pub fn from_mesh_2d(mesh: &Mesh2d) -> Result<Self, EstimationError> {
        let vertices = mesh.vertices();
        let n = vertices.len();
        let mut c0 = vec![0.0; n];
        let mut g1 = SparseEntries::new();
        for (t, tri) in mesh.triangles().iter().enumerate() {
            let area = mesh.triangle_area(t);
            if !(area > 0.0) {
                return Err(EstimationError::Structural(format!(
                    "triangle {t} has zero area"
                )));
            }
            // Edge opposite each vertex.
            let edge = |k: usize| {
                let a = vertices[tri[(k + 1) % 3]];
                let b = vertices[tri[(k + 2) % 3]];
                [b[0] - a[0], b[1] - a[1]]
            };
            let edges = [edge(0), edge(1), edge(2)];
            for i in 0..3 {
                c0[tri[i]] += area / 3.0;
                for j in 0..3 {
                    let k_ij = (edges[i][0] * edges[j][0] + edges[i][1] * edges[j][1]) / (4.0 * area);
                    *g1.entry((tri[j], tri[i])).or_insert(0.0) += k_ij;
                }
            }
        }
        Self::from_lumped(2, n, &c0, g1)
    }

    /// Accept externally discretized `C`, `G1`, `G2`.
    pub fn from_parts(
        spatial_dim: usize,
        c: SparseColMat<usize, f64>,
        g1: SparseColMat<usize, f64>,
        g2: SparseColMat<usize, f64>,
    ) -> Result<Self, EstimationError> {
        if !(1..=3).contains(&spatial_dim) {
            return Err(EstimationError::Structural(format!(
                "spatial dimension must be 1, 2 or 3, got {spatial_dim}"
            )));
        }
        let n = c.nrows();
        for (label, m) in [("C", &c), ("G1", &g1), ("G2", &g2)] {
            if m.nrows() != n || m.ncols() != n {
                return Err(EstimationError::Structural(format!(
                    "{label} is {}x{} but C is {n}x{n}",
                    m.nrows(),
                    m.ncols()
                )));
            }
            check_symmetric(label, &sparse_to_entries(m))?;
        }
        Self::from_matrices(spatial_dim, c, g1, g2)
    }

    fn from_lumped(
        spatial_dim: usize,
        n: usize,
        c0: &[f64],
        g1: SparseEntries,
    ) -> Result<Self, EstimationError> {
        if let Some(i) = c0.iter().position(|&m| !(m > 0.0) || !m.is_finite()) {
            return Err(EstimationError::Structural(format!(
                "node {i} has non-positive lumped mass {}",
                c0[i]
            )));
        }
        let c_entries: SparseEntries = c0.iter().enumerate().map(|(i, &m)| ((i, i), m)).collect();

        // G2 = G1 C⁻¹ G1, accumulated column by column of the symmetric G1.
        let mut columns: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        for (&(col, row), &value) in &g1 {
            columns[col].push((row, value));
        }
        let mut g2 = SparseEntries::new();
        for (j, column) in columns.iter().enumerate() {
            let inv_mass = 1.0 / c0[j];
            for &(a, va) in column {
                for &(b, vb) in column {
                    *g2.entry((b, a)).or_insert(0.0) += va * vb * inv_mass;
                }
            }
        }

        Self::from_matrices(
            spatial_dim,
            sparse_from_entries(n, n, &c_entries)?,
            sparse_from_entries(n, n, &g1)?,
            sparse_from_entries(n, n, &g2)?,
        )
    }

    fn from_matrices(
        spatial_dim: usize,
        c: SparseColMat<usize, f64>,
        g1: SparseColMat<usize, f64>,
        g2: SparseColMat<usize, f64>,
    ) -> Result<Self, EstimationError> {
        let n = c.nrows();
        let c_entries = sparse_to_entries(&c);
        let g1_entries = sparse_to_entries(&g1);
        let g2_entries = sparse_to_entries(&g2);
        if c_entries
            .values()
            .chain(g1_entries.values())
            .chain(g2_entries.values())
            .any(|v| !v.is_finite())
        {
            return Err(EstimationError::Structural(
                "SPDE matrices contain non-finite entries".to_string(),
            ));
        }

        let union: BTreeSet<(usize, usize)> = c_entries
            .keys()
            .chain(g1_entries.keys())
            .chain(g2_entries.keys())
            .copied()
            .collect();
        let aligned = |entries: &SparseEntries| -> Vec<f64> {
            union
                .iter()
                .map(|key| entries.get(key).copied().unwrap_or(0.0))
                .collect()
        };
        let c_vals = aligned(&c_entries);
        let g1_vals = aligned(&g1_entries);
        let g2_vals = aligned(&g2_entries);
        let template_entries: SparseEntries = union.iter().map(|&key| (key, 0.0)).collect();
        let template = sparse_from_entries(n, n, &template_entries)?;

        Ok(Self {
            spatial_dim,
            c,
            g1,
            g2,
            template,
            c_vals,
            g1_vals,
            g2_vals,
        })
    }

    pub fn dim(&self) -> usize {
        self.template.nrows()
    }

    pub fn spatial_dim(&self) -> usize {
        self.spatial_dim
    }

    pub fn c(&self) -> &SparseColMat<usize, f64> {
        &self.c
    }

    pub fn g1(&self) -> &SparseColMat<usize, f64> {
        &self.g1
    }

    pub fn g2(&self) -> &SparseColMat<usize, f64> {
        &self.g2
    }

    /// `Q(κ) = κ⁴C + 2κ²G1 + G2` on the union pattern.
    pub fn precision(&self, kappa: f64) -> SparseColMat<usize, f64> {
        let k2 = kappa * kappa;
        let k4 = k2 * k2;
        let mut q = self.template.clone();
        let (_, values) = q.parts_mut();
        for (idx, v) in values.iter_mut().enumerate() {
            *v = k4 * self.c_vals[idx] + 2.0 * k2 * self.g1_vals[idx] + self.g2_vals[idx];
        }
        q
    }

    /// Smoothness `ν = α − d/2` with the operator order α fixed at 2.
    pub fn smoothness(&self) -> f64 {
        2.0 - 0.5 * self.spatial_dim as f64
    }

    /// Distance at which correlation drops to about 0.13, `√(8ν)/κ`.
    pub fn range(&self, kappa: f64) -> f64 {
        (8.0 * self.smoothness()).sqrt() / kappa
    }

    /// Marginal standard deviation of `x/τ` for `x ~ N(0, Q(κ)⁻¹)`.
    pub fn marginal_sd(&self, kappa: f64, tau: f64) -> f64 {
        use statrs::function::gamma::gamma;
        let nu = self.smoothness();
        let d = self.spatial_dim as f64;
        let variance = gamma(nu)
            / (gamma(2.0) * (4.0 * std::f64::consts::PI).powf(0.5 * d) * kappa.powf(2.0 * nu) * tau * tau);
        variance.sqrt()
    }
}

fn check_symmetric(label: &str, entries: &SparseEntries) -> Result<(), EstimationError> {
    for (&(col, row), &value) in entries {
        let mirror = entries.get(&(row, col)).copied().unwrap_or(0.0);
        if (value - mirror).abs() > SYMMETRY_TOL * value.abs().max(1.0) {
            return Err(EstimationError::Structural(format!(
                "{label} is not symmetric at ({row}, {col}): {value} vs {mirror}"
            )));
        }
    }
    Ok(())
}
