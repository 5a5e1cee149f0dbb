pub mod inner;
pub mod laml;
pub mod smoothing;
