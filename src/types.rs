use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Scale on which an outer parameter is carried by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterTransform {
    /// Optimized as `θ = ln(x)`; the natural value is `exp(θ)`.
    Log,
    /// Optimized on its natural scale.
    Identity,
}

impl ParameterTransform {
    #[inline]
    pub fn to_natural(self, theta: f64) -> f64 {
        match self {
            ParameterTransform::Log => theta.exp(),
            ParameterTransform::Identity => theta,
        }
    }

    /// `ln|d natural / d θ|`, the change-of-variables correction.
    #[inline]
    pub fn log_jacobian(self, theta: f64) -> f64 {
        match self {
            ParameterTransform::Log => theta,
            ParameterTransform::Identity => 0.0,
        }
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct LatentField(pub Array1<f64>);

impl LatentField {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(len: usize) -> Self {
        Self(Array1::zeros(len))
    }
}

impl Deref for LatentField {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LatentField {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for LatentField {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<LatentField> for Array1<f64> {
    fn from(values: LatentField) -> Self {
        values.0
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPredictor(pub Array1<f64>);

impl LinearPredictor {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(len: usize) -> Self {
        Self(Array1::zeros(len))
    }
}

impl Deref for LinearPredictor {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LinearPredictor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for LinearPredictor {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<LinearPredictor> for Array1<f64> {
    fn from(values: LinearPredictor) -> Self {
        values.0
    }
}
