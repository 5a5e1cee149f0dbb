//! Uncertainty reporting through the joint precision of `(û, θ̂)`.
//!
//! With `Σθ` the inverse finite-difference Hessian of the Laplace objective,
//! `H` the inner Hessian at the mode and `S = dû/dθ`, the joint precision is
//!
//! ```text
//! P = [  H        −H·S          ]
//!     [ −SᵀH   Σθ⁻¹ + SᵀH·S     ]
//! ```
//!
//! Standard errors of derived quantities follow from the delta method with
//! the covariance `P⁻¹`.

use crate::estimate::{EstimationError, FitResult};
use crate::linalg::sparse_exact::{
    SparseEntries, SparseExactFactor, factorize_sparse_spd, solve_sparse_spd,
    solve_sparse_spd_multi, sparse_from_entries, sparse_matvec, sparse_to_entries,
};
use crate::linalg::utils::{matrix_inverse_with_regularization, symmetrize};
use crate::model::LatentGaussianModel;
use crate::precision::FieldStructure;
use crate::solver::laml::LaplaceObjective;
use crate::types::ParameterTransform;
use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOptions {
    /// Step of the second differences for the outer Hessian.
    pub hessian_step: f64,
    /// Step of the central differences for `dû/dθ`.
    pub sensitivity_step: f64,
    /// Step used to differentiate custom quantities.
    pub quantity_step: f64,
    /// Also report every latent element with its standard error.
    pub include_latent: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            hessian_step: 1e-3,
            sensitivity_step: 1e-4,
            quantity_step: 1e-5,
            include_latent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    pub value: f64,
    pub std_error: f64,
}

/// Caller-defined quantity `q(θ, u)`; `θ` is the full optimizer-scale vector.
pub type QuantityFn = Arc<dyn Fn(&[f64], &Array1<f64>) -> f64 + Send + Sync>;

#[derive(Clone)]
enum QuantityKind {
    Parameter(String),
    Natural(String),
    SpdeRange,
    SpdeMarginalSd,
    LatentCombination(Array1<f64>),
    Custom(QuantityFn),
}

/// A named quantity to report with a delta-method standard error.
#[derive(Clone)]
pub struct DerivedQuantity {
    name: String,
    kind: QuantityKind,
}

impl DerivedQuantity {
    /// A parameter on its optimizer scale.
    pub fn parameter(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: QuantityKind::Parameter(name.clone()),
            name,
        }
    }

    /// A parameter on its natural scale; reported as `label`.
    pub fn natural(label: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            name: label.into(),
            kind: QuantityKind::Natural(parameter.into()),
        }
    }

    /// SPDE range `√(8ν)/κ`.
    pub fn spde_range() -> Self {
        Self {
            name: "range".to_string(),
            kind: QuantityKind::SpdeRange,
        }
    }

    /// Marginal standard deviation of the scaled SPDE field.
    pub fn spde_marginal_sd() -> Self {
        Self {
            name: "marginal_sd".to_string(),
            kind: QuantityKind::SpdeMarginalSd,
        }
    }

    /// `wᵀu` for a fixed weight vector over the latent field, e.g. one row of
    /// a spline basis evaluated on a grid.
    pub fn latent_combination(name: impl Into<String>, weights: Array1<f64>) -> Self {
        Self {
            name: name.into(),
            kind: QuantityKind::LatentCombination(weights),
        }
    }

    pub fn custom<F>(name: impl Into<String>, quantity: F) -> Self
    where
        F: Fn(&[f64], &Array1<f64>) -> f64 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: QuantityKind::Custom(Arc::new(quantity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Reported quantities together with the matrices they were derived from.
#[derive(Clone)]
pub struct Report {
    entries: Vec<ReportEntry>,
    parameter_names: Vec<String>,
    outer_hessian: Array2<f64>,
    parameter_covariance: Array2<f64>,
    ridge: f64,
    sensitivity: Array2<f64>,
    joint_precision: SparseColMat<usize, f64>,
    joint_solver: JointSolver,
}

impl Report {
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Names of the estimated parameters, in covariance order.
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn outer_hessian(&self) -> &Array2<f64> {
        &self.outer_hessian
    }

    pub fn parameter_covariance(&self) -> &Array2<f64> {
        &self.parameter_covariance
    }

    /// Diagonal ridge that was needed to invert the outer Hessian.
    pub fn ridge(&self) -> f64 {
        self.ridge
    }

    /// `dû/dθ`, one column per estimated parameter.
    pub fn sensitivity(&self) -> &Array2<f64> {
        &self.sensitivity
    }

    /// Joint precision over `(u, θ)`; latent elements come first.
    pub fn joint_precision(&self) -> &SparseColMat<usize, f64> {
        &self.joint_precision
    }

    /// Stored `(row, col)` positions of the joint precision.
    pub fn joint_precision_pattern(&self) -> Vec<(usize, usize)> {
        let (symbolic, _) = self.joint_precision.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let mut pattern = Vec::with_capacity(row_idx.len());
        for col in 0..self.joint_precision.ncols() {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                pattern.push((row_idx[idx], col));
            }
        }
        pattern
    }

    /// Dense `P⁻¹`, `(n+k)²` entries built on request.
    pub fn joint_covariance(&self) -> Result<Array2<f64>, EstimationError> {
        let dim = self.joint_precision.nrows();
        let mut cov = match &self.joint_solver {
            JointSolver::Factored(factor) => solve_sparse_spd_multi(factor, &Array2::eye(dim))?,
            JointSolver::Blocks(hessian) => joint_covariance_from_blocks(
                hessian,
                &self.sensitivity,
                &self.parameter_covariance,
            )?,
        };
        symmetrize(&mut cov);
        Ok(cov)
    }

    /// `gᵀ P⁻¹ g` with a single solve.
    pub fn joint_variance(&self, gradient: &Array1<f64>) -> Result<f64, EstimationError> {
        let applied = apply_joint_covariance(
            &self.joint_solver,
            &self.sensitivity,
            &self.parameter_covariance,
            gradient,
        )?;
        Ok(gradient.dot(&applied))
    }
}

/// Applies `P⁻¹`, either through a factor of `P` or, when `P` is not numerically
/// positive definite, through the block form `[[H⁻¹ + SΣSᵀ, SΣ], [ΣSᵀ, Σ]]`.
#[derive(Clone)]
enum JointSolver {
    Factored(SparseExactFactor),
    Blocks(SparseExactFactor),
}

/// Second-difference Hessian of a scalar function.
pub(crate) fn finite_diff_hessian<F>(
    point: &Array1<f64>,
    step: f64,
    objective: &mut F,
) -> Result<Array2<f64>, EstimationError>
where
    F: FnMut(&Array1<f64>) -> Result<f64, EstimationError>,
{
    let k = point.len();
    let mut hessian = Array2::<f64>::zeros((k, k));
    let f0 = objective(point)?;
    let shifted = |deltas: &[(usize, f64)]| {
        let mut x = point.clone();
        for &(i, d) in deltas {
            x[i] += d;
        }
        x
    };
    for i in 0..k {
        let fp = objective(&shifted(&[(i, step)]))?;
        let fm = objective(&shifted(&[(i, -step)]))?;
        hessian[[i, i]] = (fp - 2.0 * f0 + fm) / (step * step);
        for j in 0..i {
            let fpp = objective(&shifted(&[(i, step), (j, step)]))?;
            let fpm = objective(&shifted(&[(i, step), (j, -step)]))?;
            let fmp = objective(&shifted(&[(i, -step), (j, step)]))?;
            let fmm = objective(&shifted(&[(i, -step), (j, -step)]))?;
            let v = (fpp - fpm - fmp + fmm) / (4.0 * step * step);
            hessian[[i, j]] = v;
            hessian[[j, i]] = v;
        }
    }
    Ok(hessian)
}

/// Central-difference Jacobian of the latent mode with respect to the free
/// parameters, each trial started from `mode`.
fn mode_sensitivity(
    objective: &LaplaceObjective<'_>,
    free: &Array1<f64>,
    mode: &Array1<f64>,
    step: f64,
) -> Result<Array2<f64>, EstimationError> {
    let n = mode.len();
    let k = free.len();
    let mut sensitivity = Array2::<f64>::zeros((n, k));
    objective.set_warm_start(Some(mode.clone()));
    for j in 0..k {
        let mut xp = free.clone();
        xp[j] += step;
        let mut xm = free.clone();
        xm[j] -= step;
        let up = objective.mode_at(&xp)?;
        let um = objective.mode_at(&xm)?;
        let column = (&up - &um) / (2.0 * step);
        sensitivity.column_mut(j).assign(&column);
    }
    Ok(sensitivity)
}

fn joint_precision(
    inner_hessian: &SparseColMat<usize, f64>,
    sensitivity: &Array2<f64>,
    theta_precision: &Array2<f64>,
) -> Result<SparseColMat<usize, f64>, EstimationError> {
    let n = inner_hessian.nrows();
    let k = sensitivity.ncols();
    let mut hs = Array2::<f64>::zeros((n, k));
    for j in 0..k {
        hs.column_mut(j)
            .assign(&sparse_matvec(inner_hessian, &sensitivity.column(j).to_owned()));
    }
    let mut theta_block = theta_precision + &sensitivity.t().dot(&hs);
    symmetrize(&mut theta_block);

    let mut entries: SparseEntries = sparse_to_entries(inner_hessian);
    for j in 0..k {
        for i in 0..n {
            let v = hs[[i, j]];
            if v != 0.0 {
                entries.insert((n + j, i), -v);
                entries.insert((i, n + j), -v);
            }
        }
        for i in 0..k {
            entries.insert((n + j, n + i), theta_block[[i, j]]);
        }
    }
    sparse_from_entries(n + k, n + k, &entries)
}

fn apply_joint_covariance(
    solver: &JointSolver,
    sensitivity: &Array2<f64>,
    parameter_covariance: &Array2<f64>,
    vector: &Array1<f64>,
) -> Result<Array1<f64>, EstimationError> {
    match solver {
        JointSolver::Factored(factor) => solve_sparse_spd(factor, vector),
        JointSolver::Blocks(hessian) => {
            let n = hessian.dim();
            let k = sensitivity.ncols();
            if vector.len() != n + k {
                return Err(EstimationError::LinearSystemSolveFailed(format!(
                    "vector has length {} but the joint covariance is {}x{}",
                    vector.len(),
                    n + k,
                    n + k
                )));
            }
            let v_latent = vector.slice(s![..n]).to_owned();
            let w = sensitivity.t().dot(&v_latent) + &vector.slice(s![n..]);
            let sigma_w = parameter_covariance.dot(&w);
            let mut out = Array1::<f64>::zeros(n + k);
            out.slice_mut(s![..n])
                .assign(&(solve_sparse_spd(hessian, &v_latent)? + sensitivity.dot(&sigma_w)));
            out.slice_mut(s![n..]).assign(&sigma_w);
            Ok(out)
        }
    }
}

/// Covariance blocks written out densely from a factor of `H`.
fn joint_covariance_from_blocks(
    hessian: &SparseExactFactor,
    sensitivity: &Array2<f64>,
    parameter_covariance: &Array2<f64>,
) -> Result<Array2<f64>, EstimationError> {
    let n = hessian.dim();
    let k = sensitivity.ncols();
    let h_inv = solve_sparse_spd_multi(hessian, &Array2::eye(n))?;
    let s_sigma = sensitivity.dot(parameter_covariance);
    let mut cov = Array2::<f64>::zeros((n + k, n + k));
    cov.slice_mut(s![..n, ..n])
        .assign(&(&h_inv + &s_sigma.dot(&sensitivity.t())));
    cov.slice_mut(s![..n, n..]).assign(&s_sigma);
    cov.slice_mut(s![n.., ..n]).assign(&s_sigma.t());
    cov.slice_mut(s![n.., n..]).assign(parameter_covariance);
    Ok(cov)
}

struct Evaluated {
    value: f64,
    gradient: Array1<f64>,
}

struct QuantityContext<'a> {
    model: &'a LatentGaussianModel,
    theta: &'a [f64],
    free: &'a Array1<f64>,
    mode: &'a Array1<f64>,
    free_slot: Vec<Option<usize>>,
    step: f64,
}

impl QuantityContext<'_> {
    fn dim(&self) -> usize {
        self.mode.len() + self.free.len()
    }

    fn parameter_index(&self, name: &str) -> Result<usize, EstimationError> {
        self.model.layout().index_of(name).ok_or_else(|| {
            EstimationError::Configuration(format!("no parameter named '{name}' in the model"))
        })
    }

    /// Unit gradient for parameter `index` scaled by `scale`, or zero when the
    /// parameter is held.
    fn parameter_gradient(&self, index: usize, scale: f64) -> Array1<f64> {
        let mut gradient = Array1::<f64>::zeros(self.dim());
        if let Some(slot) = self.free_slot[index] {
            gradient[self.mode.len() + slot] = scale;
        }
        gradient
    }

    fn spde(&self) -> Result<(&crate::structure::SpdeMatrices, usize, usize), EstimationError> {
        match self.model.structure() {
            FieldStructure::Spde(spde) => Ok((
                spde,
                self.parameter_index("log_tau")?,
                self.parameter_index("log_kappa")?,
            )),
            _ => Err(EstimationError::Configuration(
                "SPDE quantities requested for a model without an SPDE field".to_string(),
            )),
        }
    }

    fn evaluate(&self, kind: &QuantityKind) -> Result<Evaluated, EstimationError> {
        match kind {
            QuantityKind::Parameter(name) => {
                let i = self.parameter_index(name)?;
                Ok(Evaluated {
                    value: self.theta[i],
                    gradient: self.parameter_gradient(i, 1.0),
                })
            }
            QuantityKind::Natural(name) => {
                let i = self.parameter_index(name)?;
                let transform = self.model.layout().specs()[i].transform;
                let value = transform.to_natural(self.theta[i]);
                let scale = match transform {
                    ParameterTransform::Log => value,
                    ParameterTransform::Identity => 1.0,
                };
                Ok(Evaluated {
                    value,
                    gradient: self.parameter_gradient(i, scale),
                })
            }
            QuantityKind::SpdeRange => {
                let (spde, _, kappa_idx) = self.spde()?;
                let range = spde.range(self.theta[kappa_idx].exp());
                Ok(Evaluated {
                    value: range,
                    gradient: self.parameter_gradient(kappa_idx, -range),
                })
            }
            QuantityKind::SpdeMarginalSd => {
                let (spde, tau_idx, kappa_idx) = self.spde()?;
                let sd = spde.marginal_sd(self.theta[kappa_idx].exp(), self.theta[tau_idx].exp());
                let gradient = self.parameter_gradient(kappa_idx, -spde.smoothness() * sd)
                    + self.parameter_gradient(tau_idx, -sd);
                Ok(Evaluated {
                    value: sd,
                    gradient,
                })
            }
            QuantityKind::LatentCombination(weights) => {
                if weights.len() != self.mode.len() {
                    return Err(EstimationError::Configuration(format!(
                        "latent combination has {} weights for {} latent elements",
                        weights.len(),
                        self.mode.len()
                    )));
                }
                let mut gradient = Array1::<f64>::zeros(self.dim());
                gradient.slice_mut(s![..self.mode.len()]).assign(weights);
                Ok(Evaluated {
                    value: weights.dot(self.mode),
                    gradient,
                })
            }
            QuantityKind::Custom(quantity) => self.evaluate_custom(quantity),
        }
    }

    fn evaluate_custom(&self, quantity: &QuantityFn) -> Result<Evaluated, EstimationError> {
        let n = self.mode.len();
        let value = quantity(self.theta, self.mode);
        if !value.is_finite() {
            return Err(EstimationError::Configuration(format!(
                "derived quantity evaluated to {value}"
            )));
        }
        let mut gradient = Array1::<f64>::zeros(self.dim());
        let mut latent = self.mode.clone();
        for i in 0..n {
            let h = self.step * latent[i].abs().max(1.0);
            latent[i] = self.mode[i] + h;
            let fp = quantity(self.theta, &latent);
            latent[i] = self.mode[i] - h;
            let fm = quantity(self.theta, &latent);
            latent[i] = self.mode[i];
            gradient[i] = (fp - fm) / (2.0 * h);
        }
        let mut free = self.free.clone();
        for j in 0..free.len() {
            let h = self.step * free[j].abs().max(1.0);
            free[j] = self.free[j] + h;
            let fp = quantity(&self.model.expand(&free), self.mode);
            free[j] = self.free[j] - h;
            let fm = quantity(&self.model.expand(&free), self.mode);
            free[j] = self.free[j];
            gradient[n + j] = (fp - fm) / (2.0 * h);
        }
        Ok(Evaluated { value, gradient })
    }
}

fn built_in_quantities(model: &LatentGaussianModel, options: &ReportOptions) -> Vec<DerivedQuantity> {
    let mut quantities = Vec::new();
    for spec in model.layout().specs() {
        quantities.push(DerivedQuantity::parameter(spec.name.clone()));
        if spec.transform == ParameterTransform::Log {
            let label = spec
                .name
                .strip_prefix("log_")
                .map_or_else(|| format!("exp_{}", spec.name), str::to_string);
            quantities.push(DerivedQuantity::natural(label, spec.name.clone()));
        }
    }
    if matches!(model.structure(), FieldStructure::Spde(_)) {
        quantities.push(DerivedQuantity::spde_range());
        quantities.push(DerivedQuantity::spde_marginal_sd());
    }
    if options.include_latent {
        let n = model.n_latent();
        for i in 0..n {
            let mut weights = Array1::<f64>::zeros(n);
            weights[i] = 1.0;
            quantities.push(DerivedQuantity::latent_combination(format!("latent[{i}]"), weights));
        }
    }
    quantities
}

/// Compute the report for a fitted model.
pub fn build_report(fit: &FitResult, extra: &[DerivedQuantity]) -> Result<Report, EstimationError> {
    let model = fit.model();
    let options = &fit.options().report;
    let objective = LaplaceObjective::new(model, fit.options().inner.clone());
    let free = fit.free_parameters().clone();
    let mode = fit.mode().0.clone();
    let n = mode.len();
    let k = free.len();

    let outer_hessian = if k == 0 {
        Array2::<f64>::zeros((0, 0))
    } else {
        let mut value_from_mode = |x: &Array1<f64>| {
            objective.set_warm_start(Some(mode.clone()));
            objective.value(x)
        };
        finite_diff_hessian(&free, options.hessian_step, &mut value_from_mode)?
    };
    let (parameter_covariance, ridge) = if k == 0 {
        (Array2::<f64>::zeros((0, 0)), 0.0)
    } else {
        matrix_inverse_with_regularization(&outer_hessian, "outer Hessian").ok_or_else(|| {
            EstimationError::LinearSystemSolveFailed(
                "outer Hessian could not be inverted even with a ridge".to_string(),
            )
        })?
    };
    let mut theta_precision = outer_hessian.clone();
    for i in 0..k {
        theta_precision[[i, i]] += ridge;
    }

    let sensitivity = mode_sensitivity(&objective, &free, &mode, options.sensitivity_step)?;
    let joint_precision = joint_precision(fit.inner_hessian(), &sensitivity, &theta_precision)?;
    let joint_solver = match factorize_sparse_spd(&joint_precision, "joint precision") {
        Ok(factor) => JointSolver::Factored(factor),
        Err(e) => {
            log::warn!("[report] joint precision factorization failed ({e}); using block formulas");
            JointSolver::Blocks(factorize_sparse_spd(fit.inner_hessian(), "inner Hessian")?)
        }
    };

    let free_indices = model.free_indices();
    let mut free_slot = vec![None; model.layout().len()];
    for (slot, &i) in free_indices.iter().enumerate() {
        free_slot[i] = Some(slot);
    }
    let context = QuantityContext {
        model,
        theta: fit.theta(),
        free: &free,
        mode: &mode,
        free_slot,
        step: options.quantity_step,
    };

    let mut entries = Vec::new();
    for quantity in built_in_quantities(model, options).iter().chain(extra) {
        let evaluated = context.evaluate(&quantity.kind)?;
        let applied = apply_joint_covariance(
            &joint_solver,
            &sensitivity,
            &parameter_covariance,
            &evaluated.gradient,
        )?;
        let variance = evaluated.gradient.dot(&applied);
        entries.push(ReportEntry {
            name: quantity.name.clone(),
            value: evaluated.value,
            std_error: variance.max(0.0).sqrt(),
        });
    }

    let layout = model.layout();
    Ok(Report {
        entries,
        parameter_names: free_indices
            .iter()
            .map(|&i| layout.specs()[i].name.clone())
            .collect(),
        outer_hessian,
        parameter_covariance,
        ridge,
        sensitivity,
        joint_precision,
        joint_solver,
    })
}
