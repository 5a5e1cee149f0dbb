use faer::sparse::SparseColMat;
use gmrf::linalg::sparse_exact::{sparse_matvec, sparse_to_dense};
use gmrf::{FieldStructure, Mesh1d, Mesh2d, SpdeMatrices};
use ndarray::{Array1, Array2};
use std::collections::BTreeSet;

/// Regular triangulation of the unit square with `k × k` vertices.
fn unit_square_mesh(k: usize) -> Mesh2d {
    let mut vertices = Vec::with_capacity(k * k);
    for j in 0..k {
        for i in 0..k {
            vertices.push([i as f64 / (k - 1) as f64, j as f64 / (k - 1) as f64]);
        }
    }
    let mut triangles = Vec::new();
    for j in 0..k - 1 {
        for i in 0..k - 1 {
            let v = j * k + i;
            triangles.push([v, v + 1, v + k + 1]);
            triangles.push([v, v + k + 1, v + k]);
        }
    }
    Mesh2d::new(vertices, triangles).expect("valid mesh")
}

fn stored_pattern(matrix: &SparseColMat<usize, f64>) -> BTreeSet<(usize, usize)> {
    let (symbolic, _) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    let mut pattern = BTreeSet::new();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            pattern.insert((row_idx[idx], col));
        }
    }
    pattern
}

#[test]
fn precision_pattern_is_the_union_of_the_component_patterns() {
    let one_d = Mesh1d::new(vec![0.0, 0.3, 0.5, 1.1, 1.4, 2.0]).expect("mesh");
    let meshes = [
        SpdeMatrices::from_mesh_1d(&one_d).expect("spde"),
        SpdeMatrices::from_mesh_2d(&unit_square_mesh(5)).expect("spde"),
    ];
    for spde in &meshes {
        let mut union = stored_pattern(spde.c());
        union.extend(stored_pattern(spde.g1()));
        union.extend(stored_pattern(spde.g2()));
        // G2 reaches second neighbours, so the union is wider than C or G1 alone.
        assert!(union.len() > stored_pattern(spde.g1()).len());
        for kappa in [0.3, 1.0, 4.0] {
            let q = spde.precision(kappa);
            assert_eq!(stored_pattern(&q), union, "kappa = {kappa}");
        }
    }
}

#[test]
fn spde_precision_is_symmetric_positive_definite_on_a_grid() {
    let spde = SpdeMatrices::from_mesh_2d(&unit_square_mesh(6)).expect("spde");
    let structure = FieldStructure::Spde(spde.clone());
    for log_kappa in [-1.0, 0.5, 2.0] {
        let precision = structure.assemble(&[0.0, log_kappa]).expect("assemble");
        let q = sparse_to_dense(precision.matrix());
        for i in 0..q.nrows() {
            for j in 0..q.ncols() {
                assert!((q[[i, j]] - q[[j, i]]).abs() <= 1e-12 * q[[i, i]].abs().max(1.0));
            }
        }
        assert!(precision.log_determinant().expect("positive definite").is_finite());
    }
}

#[test]
fn precision_matches_operator_formula() {
    let spde = SpdeMatrices::from_mesh_2d(&unit_square_mesh(5)).expect("spde");
    let kappa = 1.7_f64;
    let c = sparse_to_dense(spde.c());
    let g1 = sparse_to_dense(spde.g1());
    let g2 = sparse_to_dense(spde.g2());
    let expected = &c * kappa.powi(4) + &g1 * (2.0 * kappa * kappa) + &g2;
    let q = sparse_to_dense(&spde.precision(kappa));
    for (a, b) in q.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-10 * b.abs().max(1.0));
    }

    // G2 = G1 C⁻¹ G1 with the lumped mass.
    let c_inv = Array2::from_diag(&c.diag().mapv(|m| 1.0 / m));
    let g2_direct = g1.dot(&c_inv).dot(&g1);
    for (a, b) in g2.iter().zip(g2_direct.iter()) {
        assert!((a - b).abs() < 1e-10 * b.abs().max(1.0));
    }
}

#[test]
fn constants_lie_in_the_stiffness_null_space() {
    let spde = SpdeMatrices::from_mesh_2d(&unit_square_mesh(4)).expect("spde");
    let ones = Array1::<f64>::ones(spde.dim());
    assert!(sparse_matvec(spde.g1(), &ones).iter().all(|v| v.abs() < 1e-12));
    // Q(κ)·1 = κ⁴·C·1.
    let kappa = 0.8_f64;
    let q1 = sparse_matvec(&spde.precision(kappa), &ones);
    let c1 = sparse_matvec(spde.c(), &ones);
    for (a, b) in q1.iter().zip(c1.iter()) {
        assert!((a - kappa.powi(4) * b).abs() < 1e-12);
    }
}

#[test]
fn degenerate_meshes_are_rejected() {
    // Collinear triangle.
    assert!(Mesh2d::new(vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]], vec![[0, 1, 2]]).is_err());
    // Vertex index out of range.
    assert!(Mesh2d::new(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]], vec![[0, 1, 3]]).is_err());
}

#[test]
fn projector_rows_are_partitions_of_unity() {
    let mesh = unit_square_mesh(5);
    let points = [[0.1, 0.2], [0.55, 0.9], [1.0, 1.0], [0.0, 0.37]];
    let projector = mesh.projector(&points).expect("projector");
    for s in projector.row_sums().iter() {
        assert!((s - 1.0).abs() < 1e-12);
    }
    assert!(mesh.projector(&[[1.2, 0.5]]).is_err());
}
