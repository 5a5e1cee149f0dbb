use crate::estimate::EstimationError;
use crate::families::Observations;
use crate::matrix::{LinkMap, dense_matvec};
use crate::precision::{FieldStructure, ParameterSpec, PrecisionMatrix};
use crate::priors::HyperPriorSet;
use crate::solver::smoothing::OuterBounds;
use crate::types::{LatentField, LinearPredictor, ParameterTransform};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// How the latent vector enters the linear predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldScaling {
    /// `field = A·u / τ`: the latent vector is the unscaled SPDE solution.
    Unscaled,
    /// `field = A·u`.
    Direct,
}

impl FieldScaling {
    pub fn for_structure(structure: &FieldStructure) -> Self {
        match structure {
            FieldStructure::Spde(_) => FieldScaling::Unscaled,
            _ => FieldScaling::Direct,
        }
    }
}

/// Ordering of the outer parameter vector: structure hyperparameters, then
/// family hyperparameters, then fixed effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterLayout {
    specs: Vec<ParameterSpec>,
    structure: Range<usize>,
    family: Range<usize>,
    fixed_effects: Range<usize>,
}

impl ParameterLayout {
    fn new(
        structure: Vec<ParameterSpec>,
        family: Vec<ParameterSpec>,
        fixed_effects: Vec<ParameterSpec>,
    ) -> Self {
        let s = structure.len();
        let f = family.len();
        let b = fixed_effects.len();
        let mut specs = structure;
        specs.extend(family);
        specs.extend(fixed_effects);
        Self {
            specs,
            structure: 0..s,
            family: s..s + f,
            fixed_effects: s + f..s + f + b,
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    pub fn structure_range(&self) -> Range<usize> {
        self.structure.clone()
    }

    pub fn family_range(&self) -> Range<usize> {
        self.family.clone()
    }

    pub fn fixed_effect_range(&self) -> Range<usize> {
        self.fixed_effects.clone()
    }

    pub fn initial(&self) -> Array1<f64> {
        self.specs.iter().map(|s| s.initial).collect()
    }
}

/// Everything needed to evaluate the objective: structure, link, data and
/// priors. Immutable once built; passed explicitly to the solvers.
#[derive(Clone)]
pub struct LatentGaussianModel {
    structure: FieldStructure,
    link: LinkMap,
    scaling: FieldScaling,
    design: Option<Array2<f64>>,
    offset: Option<Array1<f64>>,
    observations: Observations,
    priors: HyperPriorSet,
    layout: ParameterLayout,
    held: BTreeMap<usize, f64>,
}

impl LatentGaussianModel {
    pub fn builder(structure: FieldStructure, observations: Observations) -> ModelBuilder {
        ModelBuilder {
            structure,
            observations,
            link: None,
            design: None,
            offset: None,
            priors: HyperPriorSet::default(),
            initial: Vec::new(),
            held: Vec::new(),
        }
    }

    pub fn structure(&self) -> &FieldStructure {
        &self.structure
    }

    pub fn link(&self) -> &LinkMap {
        &self.link
    }

    pub fn scaling(&self) -> FieldScaling {
        self.scaling
    }

    pub fn observations(&self) -> &Observations {
        &self.observations
    }

    pub fn priors(&self) -> &HyperPriorSet {
        &self.priors
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn design(&self) -> Option<&Array2<f64>> {
        self.design.as_ref()
    }

    pub fn n_latent(&self) -> usize {
        self.structure.dim()
    }

    pub fn n_obs(&self) -> usize {
        self.observations.len()
    }

    /// Indices of parameters the outer optimizer moves.
    pub fn free_indices(&self) -> Vec<usize> {
        (0..self.layout.len())
            .filter(|i| !self.held.contains_key(i))
            .collect()
    }

    pub fn is_held(&self, index: usize) -> bool {
        self.held.contains_key(&index)
    }

    /// Starting values of the free parameters.
    pub fn initial_free(&self) -> Array1<f64> {
        let initial = self.layout.initial();
        self.free_indices().iter().map(|&i| initial[i]).collect()
    }

    /// Box for the free parameters: `±log_bound` on log-scale entries, unbounded otherwise.
    pub fn free_bounds(&self, log_bound: f64) -> OuterBounds {
        let specs = self.layout.specs();
        let free = self.free_indices();
        let mut bounds = OuterBounds::unbounded(free.len());
        for (slot, &i) in free.iter().enumerate() {
            if specs[i].transform == ParameterTransform::Log {
                bounds.lower[slot] = -log_bound;
                bounds.upper[slot] = log_bound;
            }
        }
        bounds
    }

    /// Full parameter vector from the free parameters.
    pub fn expand(&self, free: &Array1<f64>) -> Vec<f64> {
        let mut theta = self.layout.initial().to_vec();
        for (&i, &value) in &self.held {
            theta[i] = value;
        }
        for (slot, &i) in self.free_indices().iter().enumerate() {
            theta[i] = free[slot];
        }
        theta
    }

    pub fn structure_theta<'t>(&self, theta: &'t [f64]) -> &'t [f64] {
        &theta[self.layout.structure_range()]
    }

    pub fn family_theta<'t>(&self, theta: &'t [f64]) -> &'t [f64] {
        &theta[self.layout.family_range()]
    }

    pub fn fixed_effects<'t>(&self, theta: &'t [f64]) -> &'t [f64] {
        &theta[self.layout.fixed_effect_range()]
    }

    pub fn assemble_precision(&self, theta: &[f64]) -> Result<PrecisionMatrix, EstimationError> {
        self.check_theta(theta)?;
        self.structure.assemble(self.structure_theta(theta))
    }

    pub(crate) fn check_theta(&self, theta: &[f64]) -> Result<(), EstimationError> {
        if theta.len() != self.layout.len() {
            return Err(EstimationError::Configuration(format!(
                "expected {} parameters, got {}",
                self.layout.len(),
                theta.len()
            )));
        }
        Ok(())
    }

    /// Multiplier applied to `A·u` in the linear predictor.
    pub fn field_scale(&self, theta: &[f64]) -> f64 {
        match self.scaling {
            FieldScaling::Unscaled => self.structure.field_scale(self.structure_theta(theta)),
            FieldScaling::Direct => 1.0,
        }
    }

    /// `Xβ + offset`, the part of `η` that does not depend on the latent field.
    pub fn fixed_predictor(&self, theta: &[f64]) -> Array1<f64> {
        let mut eta = match &self.design {
            Some(x) => dense_matvec(x, &Array1::from(self.fixed_effects(theta).to_vec())),
            None => Array1::zeros(self.n_obs()),
        };
        if let Some(offset) = &self.offset {
            eta += offset;
        }
        eta
    }

    /// `η = Xβ + offset + s·A·u`.
    pub fn linear_predictor(
        &self,
        latent: &LatentField,
        theta: &[f64],
    ) -> Result<LinearPredictor, EstimationError> {
        self.check_theta(theta)?;
        if latent.len() != self.n_latent() {
            return Err(EstimationError::Configuration(format!(
                "latent field has length {} but the model has {} elements",
                latent.len(),
                self.n_latent()
            )));
        }
        let mut eta = self.fixed_predictor(theta);
        let field = self.link.apply(latent);
        eta.scaled_add(self.field_scale(theta), &field);
        Ok(LinearPredictor::new(eta))
    }

    /// Sum of hyper-prior terms, including the log-scale Jacobian when enabled.
    pub fn hyper_prior_nll(&self, theta: &[f64]) -> f64 {
        let specs = self.layout.specs();
        self.priors
            .entries()
            .iter()
            .filter_map(|(name, prior)| {
                self.layout
                    .index_of(name)
                    .map(|i| self.priors.term(prior, specs[i].transform, theta[i]))
            })
            .sum()
    }
}

/// Incremental construction of a [`LatentGaussianModel`].
pub struct ModelBuilder {
    structure: FieldStructure,
    observations: Observations,
    link: Option<LinkMap>,
    design: Option<Array2<f64>>,
    offset: Option<Array1<f64>>,
    priors: HyperPriorSet,
    initial: Vec<(String, f64)>,
    held: Vec<(String, f64)>,
}

impl ModelBuilder {
    /// Map from latent elements to observations; identity when omitted.
    pub fn link(mut self, link: LinkMap) -> Self {
        self.link = Some(link);
        self
    }

    /// Dense fixed-effect design; coefficients are named `beta_0`, `beta_1`, ….
    pub fn design(mut self, design: Array2<f64>) -> Self {
        self.design = Some(design);
        self
    }

    pub fn offset(mut self, offset: Array1<f64>) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn priors(mut self, priors: HyperPriorSet) -> Self {
        self.priors = priors;
        self
    }

    /// Starting value for a named parameter (optimizer scale).
    pub fn initial(mut self, name: impl Into<String>, value: f64) -> Self {
        self.initial.push((name.into(), value));
        self
    }

    /// Hold a named parameter at `value` (optimizer scale) instead of
    /// estimating it.
    pub fn hold(mut self, name: impl Into<String>, value: f64) -> Self {
        self.held.push((name.into(), value));
        self
    }

    pub fn build(self) -> Result<LatentGaussianModel, EstimationError> {
        let n_obs = self.observations.len();
        let n_latent = self.structure.dim();
        if n_obs == 0 {
            return Err(EstimationError::Configuration(
                "model has no observations".to_string(),
            ));
        }
        let link = match self.link {
            Some(link) => link,
            None if n_obs == n_latent => LinkMap::identity(n_latent)?,
            None => {
                return Err(EstimationError::Configuration(format!(
                    "{n_obs} observations but {n_latent} latent elements and no link map"
                )));
            }
        };
        if link.nrows() != n_obs || link.ncols() != n_latent {
            return Err(EstimationError::Configuration(format!(
                "link map is {}x{} but the model has {n_obs} observations and {n_latent} latent elements",
                link.nrows(),
                link.ncols()
            )));
        }
        let mut fixed_specs = Vec::new();
        if let Some(x) = &self.design {
            if x.nrows() != n_obs {
                return Err(EstimationError::Configuration(format!(
                    "design has {} rows for {n_obs} observations",
                    x.nrows()
                )));
            }
            if x.iter().any(|v| !v.is_finite()) {
                return Err(EstimationError::Configuration(
                    "design matrix contains non-finite values".to_string(),
                ));
            }
            fixed_specs = (0..x.ncols())
                .map(|j| ParameterSpec::raw(format!("beta_{j}"), 0.0))
                .collect();
        }
        if let Some(offset) = &self.offset
            && (offset.len() != n_obs || offset.iter().any(|v| !v.is_finite()))
        {
            return Err(EstimationError::Configuration(
                "offset must be finite with one entry per observation".to_string(),
            ));
        }

        let mut layout = ParameterLayout::new(
            self.structure.hyper_specs(),
            self.observations.family().hyper_specs(),
            fixed_specs,
        );
        let lookup = |layout: &ParameterLayout, name: &str| {
            layout.index_of(name).ok_or_else(|| {
                EstimationError::Configuration(format!(
                    "unknown parameter '{name}'; model parameters are {:?}",
                    layout.names()
                ))
            })
        };
        for (name, value) in &self.initial {
            let i = lookup(&layout, name)?;
            layout.specs[i].initial = *value;
        }
        let mut held = BTreeMap::new();
        for (name, value) in &self.held {
            held.insert(lookup(&layout, name)?, *value);
        }
        for (name, _) in self.priors.entries() {
            lookup(&layout, name)?;
        }

        Ok(LatentGaussianModel {
            scaling: FieldScaling::for_structure(&self.structure),
            structure: self.structure,
            link,
            design: self.design,
            offset: self.offset,
            observations: self.observations,
            priors: self.priors,
            layout,
            held,
        })
    }
}
