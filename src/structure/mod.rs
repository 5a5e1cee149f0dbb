pub mod mesh;
pub mod penalty;
pub mod random_walk;
pub mod spde;

pub use mesh::{Mesh1d, Mesh2d};
pub use penalty::BlockDiagonalPenalty;
pub use random_walk::{RecruitmentDynamics, StateSpaceStructure};
pub use spde::SpdeMatrices;
