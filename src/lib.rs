#![deny(dead_code)]
#![deny(unused_imports)]

pub mod density;
pub mod estimate;
pub mod families;
pub mod inference;
pub mod linalg;
pub mod matrix;
pub mod model;
pub mod objective;
pub mod precision;
pub mod priors;
pub mod probability;
pub mod solver;
pub mod structure;
pub mod types;

pub use density::JointDensity;
pub use estimate::{EstimationError, FitOptions, FitResult, fit_model, fit_model_with, fit_models};
pub use families::{ObservationFamily, Observations};
pub use inference::report::{DerivedQuantity, Report, ReportEntry, ReportOptions};
pub use matrix::LinkMap;
pub use model::{FieldScaling, LatentGaussianModel, ModelBuilder, ParameterLayout};
pub use objective::{EvaluationMode, ObjectiveTerms};
pub use precision::{FieldStructure, LogDeterminant, ParameterSpec, PrecisionMatrix};
pub use priors::{HyperPrior, HyperPriorSet};
pub use solver::inner::{InnerOptions, InnerSolution};
pub use solver::laml::{LaplaceEvaluation, LaplaceObjective};
pub use solver::smoothing::{
    OuterBounds, OuterOptimizer, OuterOptions, OuterSolution, WolfeBfgs,
};
pub use structure::{
    BlockDiagonalPenalty, Mesh1d, Mesh2d, RecruitmentDynamics, SpdeMatrices, StateSpaceStructure,
};
pub use types::{LatentField, LinearPredictor, ParameterTransform};
