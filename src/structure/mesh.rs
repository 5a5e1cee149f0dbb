use crate::estimate::EstimationError;
use crate::matrix::LinkMap;

const AREA_REL_TOL: f64 = 1e-12;
const BARYCENTRIC_TOL: f64 = 1e-10;

/// Piecewise-linear discretization of an interval.
#[derive(Debug, Clone)]
pub struct Mesh1d {
    nodes: Vec<f64>,
}

impl Mesh1d {
    pub fn new(nodes: Vec<f64>) -> Result<Self, EstimationError> {
        if nodes.len() < 2 {
            return Err(EstimationError::Structural(format!(
                "a 1-D mesh needs at least two nodes, got {}",
                nodes.len()
            )));
        }
        if nodes.iter().any(|x| !x.is_finite()) {
            return Err(EstimationError::Structural(
                "mesh nodes must be finite".to_string(),
            ));
        }
        for (i, pair) in nodes.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(EstimationError::Structural(format!(
                    "mesh interval {i} has non-positive length ({} -> {})",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Linear-interpolation weights of each point onto the two nodes of its interval.
    pub fn projector(&self, points: &[f64]) -> Result<LinkMap, EstimationError> {
        let first = self.nodes[0];
        let last = self.nodes[self.nodes.len() - 1];
        let mut triplets = Vec::with_capacity(2 * points.len());
        for (row, &x) in points.iter().enumerate() {
            if !x.is_finite() || x < first || x > last {
                return Err(EstimationError::Structural(format!(
                    "point {row} at {x} lies outside the mesh [{first}, {last}]"
                )));
            }
            let right = self
                .nodes
                .partition_point(|&node| node <= x)
                .clamp(1, self.nodes.len() - 1);
            let left = right - 1;
            let h = self.nodes[right] - self.nodes[left];
            let w = (x - self.nodes[left]) / h;
            triplets.push((row, left, 1.0 - w));
            triplets.push((row, right, w));
        }
        LinkMap::from_triplets(points.len(), self.nodes.len(), &triplets)
    }
}

/// Triangulation of a planar domain.
#[derive(Debug, Clone)]
pub struct Mesh2d {
    vertices: Vec<[f64; 2]>,
    triangles: Vec<[usize; 3]>,
}

impl Mesh2d {
    pub fn new(vertices: Vec<[f64; 2]>, triangles: Vec<[usize; 3]>) -> Result<Self, EstimationError> {
        if vertices.is_empty() || triangles.is_empty() {
            return Err(EstimationError::Structural(
                "a 2-D mesh needs at least one triangle".to_string(),
            ));
        }
        if vertices.iter().flatten().any(|x| !x.is_finite()) {
            return Err(EstimationError::Structural(
                "mesh vertices must be finite".to_string(),
            ));
        }
        let extent = bounding_extent(&vertices);
        let mut referenced = vec![false; vertices.len()];
        for (t, tri) in triangles.iter().enumerate() {
            for &v in tri {
                if v >= vertices.len() {
                    return Err(EstimationError::Structural(format!(
                        "triangle {t} references vertex {v} but the mesh has {} vertices",
                        vertices.len()
                    )));
                }
                referenced[v] = true;
            }
            let area = signed_area(&vertices, tri).abs();
            if area <= AREA_REL_TOL * extent * extent {
                return Err(EstimationError::Structural(format!(
                    "triangle {t} is degenerate (area {area:.3e})"
                )));
            }
        }
        if let Some(orphan) = referenced.iter().position(|r| !r) {
            return Err(EstimationError::Structural(format!(
                "vertex {orphan} is not part of any triangle"
            )));
        }
        Ok(Self {
            vertices,
            triangles,
        })
    }

    pub fn vertices(&self) -> &[[f64; 2]] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_area(&self, t: usize) -> f64 {
        signed_area(&self.vertices, &self.triangles[t]).abs()
    }

    /// Barycentric weights of each point within the first triangle containing it.
    pub fn projector(&self, points: &[[f64; 2]]) -> Result<LinkMap, EstimationError> {
        let mut triplets = Vec::with_capacity(3 * points.len());
        for (row, p) in points.iter().enumerate() {
            let located = self
                .triangles
                .iter()
                .find_map(|tri| barycentric(&self.vertices, tri, p).map(|w| (tri, w)));
            let Some((tri, weights)) = located else {
                return Err(EstimationError::Structural(format!(
                    "point {row} at ({}, {}) is not inside any mesh triangle",
                    p[0], p[1]
                )));
            };
            for k in 0..3 {
                triplets.push((row, tri[k], weights[k]));
            }
        }
        LinkMap::from_triplets(points.len(), self.vertices.len(), &triplets)
    }
}

fn bounding_extent(vertices: &[[f64; 2]]) -> f64 {
    let mut lo = [f64::INFINITY; 2];
    let mut hi = [f64::NEG_INFINITY; 2];
    for v in vertices {
        for d in 0..2 {
            lo[d] = lo[d].min(v[d]);
            hi[d] = hi[d].max(v[d]);
        }
    }
    (hi[0] - lo[0]).max(hi[1] - lo[1]).max(f64::MIN_POSITIVE)
}

pub(crate) fn signed_area(vertices: &[[f64; 2]], tri: &[usize; 3]) -> f64 {
    let [a, b, c] = [vertices[tri[0]], vertices[tri[1]], vertices[tri[2]]];
    0.5 * ((b[0] - a[0]) * (c[1] - a[1]) - (c[0] - a[0]) * (b[1] - a[1]))
}

fn barycentric(vertices: &[[f64; 2]], tri: &[usize; 3], p: &[f64; 2]) -> Option<[f64; 3]> {
    let [a, b, c] = [vertices[tri[0]], vertices[tri[1]], vertices[tri[2]]];
    let det = (b[1] - c[1]) * (a[0] - c[0]) + (c[0] - b[0]) * (a[1] - c[1]);
    let w0 = ((b[1] - c[1]) * (p[0] - c[0]) + (c[0] - b[0]) * (p[1] - c[1])) / det;
    let w1 = ((c[1] - a[1]) * (p[0] - c[0]) + (a[0] - c[0]) * (p[1] - c[1])) / det;
    let w2 = 1.0 - w0 - w1;
    if w0 >= -BARYCENTRIC_TOL && w1 >= -BARYCENTRIC_TOL && w2 >= -BARYCENTRIC_TOL {
        Some([w0, w1, w2])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn unit_square() -> Mesh2d {
        Mesh2d::new(
            vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
            vec![[0, 1, 2], [0, 2, 3]],
        )
        .expect("valid mesh")
    }

    #[test]
    fn one_dimensional_projector_interpolates_linearly() {
        let mesh = Mesh1d::new(vec![0.0, 1.0, 3.0]).expect("mesh");
        let a = mesh.projector(&[0.25, 2.0, 3.0]).expect("inside");
        let values = a.apply(&array![0.0, 4.0, 8.0]);
        assert!((values[0] - 1.0).abs() < 1e-12);
        assert!((values[1] - 6.0).abs() < 1e-12);
        assert!((values[2] - 8.0).abs() < 1e-12);
        assert!(mesh.projector(&[3.5]).is_err());
    }

    #[test]
    fn zero_length_interval_is_structural_error() {
        assert!(matches!(
            Mesh1d::new(vec![0.0, 1.0, 1.0]),
            Err(EstimationError::Structural(_))
        ));
    }

    #[test]
    fn degenerate_triangle_is_rejected() {
        let err = Mesh2d::new(
            vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]],
            vec![[0, 1, 2]],
        );
        assert!(matches!(err, Err(EstimationError::Structural(_))));
    }

    #[test]
    fn barycentric_projector_reproduces_linear_functions() {
        let mesh = unit_square();
        // f(x, y) = 1 + 2x - y at the vertices
        let f = array![1.0, 3.0, 2.0, 0.0];
        let pts = [[0.25, 0.1], [0.3, 0.9], [1.0, 1.0]];
        let a = mesh.projector(&pts).expect("inside");
        let got = a.apply(&f);
        for (i, p) in pts.iter().enumerate() {
            assert!((got[i] - (1.0 + 2.0 * p[0] - p[1])).abs() < 1e-12);
        }
        for s in a.row_sums().iter() {
            assert!((s - 1.0).abs() < 1e-12);
        }
        assert!(mesh.projector(&[[1.5, 0.5]]).is_err());
    }
}
