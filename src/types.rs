use crate::precision::{Precision, PrecisionKind, Widen};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Index;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Domain and target problems are raised before optimisation starts;
/// divergence is raised at the evaluation that produced the non-finite value.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// A divisor of the homogenization model is exactly zero.
    #[error("singular homogenization model: {quantity} is zero")]
    SingularModel { quantity: &'static str },

    /// A measured coefficient is zero, negative or non-finite.
    #[error("invalid target {coefficient} = {value}: targets must be finite and positive")]
    InvalidTarget { coefficient: Coefficient, value: f64 },

    #[error("unknown coefficient `{0}` (expected one of h1111, h1133, h1313, h1212, h3333)")]
    UnknownCoefficient(String),

    #[error("no target given for {0}")]
    MissingCoefficient(Coefficient),

    /// Loss or gradient became non-finite during optimisation.
    #[error("{stage} diverged at evaluation {evaluation}: loss = {loss}")]
    Divergence { stage: Stage, evaluation: usize, loss: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A parameter or gradient slice does not have one entry per parameter.
    #[error("shape error: {0}")]
    Shape(String),

    #[error("cannot read config {}: {source}", .path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The argmin backend returned an error.
    #[error("solver error: {0}")]
    Solver(String),
}

impl From<argmin::core::Error> for CalibrationError {
    fn from(e: argmin::core::Error) -> Self {
        match e.downcast::<CalibrationError>() {
            Ok(inner) => inner,
            Err(other) => Self::Solver(other.to_string()),
        }
    }
}

pub type CalibrationResult<T> = Result<T, CalibrationError>;

// ─────────────────────────────────────────────────────────────
//  Coefficients
// ─────────────────────────────────────────────────────────────

/// Effective stiffness coefficients of the laminate, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Coefficient {
    H1111,
    H1133,
    H1313,
    H1212,
    H3333,
}

pub const NUM_COEFFICIENTS: usize = 5;

impl Coefficient {
    pub const ALL: [Coefficient; NUM_COEFFICIENTS] = [
        Coefficient::H1111,
        Coefficient::H1133,
        Coefficient::H1313,
        Coefficient::H1212,
        Coefficient::H3333,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::H1111 => "h1111",
            Self::H1133 => "h1133",
            Self::H1313 => "h1313",
            Self::H1212 => "h1212",
            Self::H3333 => "h3333",
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Coefficient {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Coefficient::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| CalibrationError::UnknownCoefficient(s.to_string()))
    }
}

/// One value per coefficient, indexed by [`Coefficient`].
///
/// Used for predicted coefficients, residuals and (in `f64`) targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoefficientSet<F> {
    values: [F; NUM_COEFFICIENTS],
}

impl<F: Copy> CoefficientSet<F> {
    pub fn from_array(values: [F; NUM_COEFFICIENTS]) -> Self {
        Self { values }
    }

    pub fn as_array(&self) -> &[F; NUM_COEFFICIENTS] {
        &self.values
    }

    pub fn get(&self, c: Coefficient) -> F {
        self.values[c.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Coefficient, F)> + '_ {
        Coefficient::ALL.into_iter().zip(self.values.iter().copied())
    }
}

impl<F: Precision> CoefficientSet<F> {
    /// Round every value into another precision.
    pub fn cast<T: Precision>(&self) -> CoefficientSet<T> {
        CoefficientSet::from_array(self.values.map(|v| T::lit(v.as_f64())))
    }

    pub fn to_f64(&self) -> CoefficientSet<f64> {
        CoefficientSet::from_array(self.values.map(Precision::as_f64))
    }
}

impl<F> Index<Coefficient> for CoefficientSet<F> {
    type Output = F;

    fn index(&self, c: Coefficient) -> &F {
        &self.values[c.index()]
    }
}

/// Rows: coefficients (canonical order).  Columns: parameters
/// `[e1, nu1, e2, nu2, d1]`.
pub type Jacobian<F> = [[F; NUM_PARAMETERS]; NUM_COEFFICIENTS];

// ─────────────────────────────────────────────────────────────
//  Measured targets
// ─────────────────────────────────────────────────────────────

/// The five measured coefficients.  Always complete, always finite and
/// strictly positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasuredTargets {
    values: CoefficientSet<f64>,
}

impl MeasuredTargets {
    /// Build from values in canonical coefficient order.
    pub fn new(values: [f64; NUM_COEFFICIENTS]) -> CalibrationResult<Self> {
        for (c, v) in Coefficient::ALL.into_iter().zip(values) {
            if !(v.is_finite() && v > 0.0) {
                return Err(CalibrationError::InvalidTarget { coefficient: c, value: v });
            }
        }
        Ok(Self { values: CoefficientSet::from_array(values) })
    }

    /// Build from a name → value table.  Every name must be a known
    /// coefficient and every coefficient must be present.
    pub fn from_map(map: &BTreeMap<String, f64>) -> CalibrationResult<Self> {
        let mut values = [None; NUM_COEFFICIENTS];
        for (name, &value) in map {
            let c: Coefficient = name.parse()?;
            values[c.index()] = Some(value);
        }
        let mut out = [0.0; NUM_COEFFICIENTS];
        for c in Coefficient::ALL {
            out[c.index()] = values[c.index()].ok_or(CalibrationError::MissingCoefficient(c))?;
        }
        Self::new(out)
    }

    /// Coefficients of the reference laminate used throughout the tests and
    /// as the CLI default.
    pub fn reference() -> Self {
        Self {
            values: CoefficientSet::from_array([
                99.5868945877107,
                4.00174342801634,
                7.67307316987048,
                33.0056387729023,
                1.78777067612793,
            ]),
        }
    }

    pub fn get(&self, c: Coefficient) -> f64 {
        self.values.get(c)
    }

    pub fn values(&self) -> &CoefficientSet<f64> {
        &self.values
    }

    /// The targets rounded into a stage's working precision.
    pub fn at_precision<F: Precision>(&self) -> CoefficientSet<F> {
        self.values.cast()
    }
}

// ─────────────────────────────────────────────────────────────
//  Model parameters
// ─────────────────────────────────────────────────────────────

pub const NUM_PARAMETERS: usize = 5;

/// Parameter names in packing order.
pub const PARAMETER_NAMES: [&str; NUM_PARAMETERS] = ["E1", "nu1", "E2", "nu2", "d1"];

/// Constituent parameters of the two-layer laminate.
///
/// `d2` is not stored: it is always `1 - d1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParameters<F> {
    pub e1: F,
    pub nu1: F,
    pub e2: F,
    pub nu2: F,
    pub d1: F,
}

impl<F: Precision> ModelParameters<F> {
    pub fn new(e1: F, nu1: F, e2: F, nu2: F, d1: F) -> Self {
        Self { e1, nu1, e2, nu2, d1 }
    }

    /// Literal starting point: E1=100, nu1=0.3, E2=200, nu2=0.25, d1=0.5.
    pub fn seed() -> Self {
        Self::from_f64(&ModelParameters::new(100.0, 0.3, 200.0, 0.25, 0.5))
    }

    pub fn from_f64(p: &ModelParameters<f64>) -> Self {
        Self::new(F::lit(p.e1), F::lit(p.nu1), F::lit(p.e2), F::lit(p.nu2), F::lit(p.d1))
    }

    #[inline]
    pub fn d2(&self) -> F {
        F::one() - self.d1
    }

    /// Pack into the optimiser vector `[e1, nu1, e2, nu2, d1]`.
    pub fn to_array(&self) -> [F; NUM_PARAMETERS] {
        [self.e1, self.nu1, self.e2, self.nu2, self.d1]
    }

    pub fn from_array(theta: [F; NUM_PARAMETERS]) -> Self {
        let [e1, nu1, e2, nu2, d1] = theta;
        Self { e1, nu1, e2, nu2, d1 }
    }

    /// Unpack an optimiser vector of exactly [`NUM_PARAMETERS`] entries.
    pub fn from_slice(theta: &[F]) -> CalibrationResult<Self> {
        let theta: [F; NUM_PARAMETERS] = theta.try_into().map_err(|_| {
            CalibrationError::Shape(format!(
                "parameter vector has {} entries, expected {NUM_PARAMETERS}",
                theta.len()
            ))
        })?;
        Ok(Self::from_array(theta))
    }

    /// Copy every field into a precision at least as wide.  The result shares
    /// nothing with `self`.
    pub fn escalate<T: Precision>(&self) -> ModelParameters<T>
    where
        F: Widen<T>,
    {
        ModelParameters::from_array(self.to_array().map(<F as Widen<T>>::widen))
    }

    pub fn to_f64(&self) -> ModelParameters<f64> {
        ModelParameters::from_array(self.to_array().map(Precision::as_f64))
    }
}

// ─────────────────────────────────────────────────────────────
//  Solver options
// ─────────────────────────────────────────────────────────────

/// Stage A: Adam, fixed budget, no early stopping.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct AdamOptions {
    pub iterations: usize,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            iterations: 1000,
            learning_rate: 1e-2,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Line search used by stage B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineSearch {
    /// Built-in L-BFGS with a strong-Wolfe bracketing / zoom search.
    #[default]
    Wolfe,
    /// argmin's `LBFGS` with `MoreThuenteLineSearch`.
    MoreThuente,
}

/// Stage B: L-BFGS to tolerance or iteration bound.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RefineOptions {
    pub max_iterations: usize,
    pub max_evaluations: usize,
    pub tolerance_grad: f64,
    /// Built-in backend: relative, stop when `|f - f_prev| <= tol * |f_prev|`
    /// or when every step component is at most `tol`.  The argmin backend
    /// passes it on as its absolute cost-change tolerance.
    pub tolerance_change: f64,
    pub history_size: usize,
    pub line_search: LineSearch,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            max_evaluations: 2500,
            tolerance_grad: 1e-15,
            tolerance_change: 1e-15,
            history_size: 100,
            line_search: LineSearch::Wolfe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PrecisionOptions {
    pub stage_a: PrecisionKind,
    pub stage_b: PrecisionKind,
}

impl Default for PrecisionOptions {
    fn default() -> Self {
        Self {
            stage_a: PrecisionKind::Single,
            stage_b: PrecisionKind::Double,
        }
    }
}

/// Everything that parameterises one calibration run.  Fixed for the whole
/// run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct CalibrationOptions {
    pub precision: PrecisionOptions,
    pub stage_a: AdamOptions,
    pub stage_b: RefineOptions,
    /// Log (and record) the loss every this many iterations.
    pub progress_interval: usize,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            precision: PrecisionOptions::default(),
            stage_a: AdamOptions::default(),
            stage_b: RefineOptions::default(),
            progress_interval: 100,
        }
    }
}

impl CalibrationOptions {
    /// Reject option values no run could use.
    pub fn validate(&self) -> CalibrationResult<()> {
        let invalid = |msg: String| Err(CalibrationError::InvalidConfig(msg));
        let a = &self.stage_a;
        let b = &self.stage_b;
        if self.precision.stage_b < self.precision.stage_a {
            return invalid(format!(
                "stage B precision ({}) is narrower than stage A precision ({})",
                self.precision.stage_b, self.precision.stage_a,
            ));
        }
        if self.progress_interval == 0 {
            return invalid("progress-interval must be at least 1".into());
        }
        if !(a.learning_rate.is_finite() && a.learning_rate > 0.0) {
            return invalid(format!("stage-a learning-rate must be positive, got {}", a.learning_rate));
        }
        for (name, beta) in [("beta1", a.beta1), ("beta2", a.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return invalid(format!("stage-a {name} must lie in [0, 1), got {beta}"));
            }
        }
        if !(a.epsilon.is_finite() && a.epsilon > 0.0) {
            return invalid(format!("stage-a epsilon must be positive, got {}", a.epsilon));
        }
        if b.max_iterations == 0 || b.max_evaluations == 0 {
            return invalid("stage-b iteration and evaluation bounds must be at least 1".into());
        }
        if b.history_size == 0 {
            return invalid("stage-b history-size must be at least 1".into());
        }
        for (name, tol) in [("tolerance-grad", b.tolerance_grad), ("tolerance-change", b.tolerance_change)] {
            if !(tol.is_finite() && tol >= 0.0) {
                return invalid(format!("stage-b {name} must be finite and non-negative, got {tol}"));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Reports
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Coarse first-order stage.
    Adam,
    /// Quasi-Newton refinement.
    Lbfgs,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Adam => "adam",
            Self::Lbfgs => "lbfgs",
        })
    }
}

/// Why a stage stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stage A ran its full iteration budget.
    BudgetExhausted,
    /// ‖g‖∞ fell below the gradient tolerance.
    GradientTolerance,
    /// Relative loss change fell below the change tolerance.
    LossChange,
    /// The accepted step was below the change tolerance.
    StepTolerance,
    /// The search direction was not a descent direction.
    NonDescentDirection,
    MaxIterations,
    MaxEvaluations,
    /// argmin's gradient-norm test passed.
    SolverConverged,
    /// argmin's cost-change test fired with the gradient norm still above
    /// the gradient tolerance.
    CostStalled,
    /// argmin's line search failed.
    LineSearchFailed,
}

impl StopReason {
    /// `false` for the bounds and for stops that left no usable direction.
    pub fn converged(self) -> bool {
        !matches!(
            self,
            Self::MaxIterations
                | Self::MaxEvaluations
                | Self::NonDescentDirection
                | Self::CostStalled
                | Self::LineSearchFailed
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BudgetExhausted => "iteration budget exhausted",
            Self::GradientTolerance => "gradient tolerance reached",
            Self::LossChange => "loss change below tolerance",
            Self::StepTolerance => "step below tolerance",
            Self::NonDescentDirection => "no descent direction",
            Self::MaxIterations => "iteration bound reached",
            Self::MaxEvaluations => "evaluation bound reached",
            Self::SolverConverged => "solver converged",
            Self::CostStalled => "cost stalled above the gradient tolerance",
            Self::LineSearchFailed => "line search failed",
        })
    }
}

/// One sampled progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressPoint {
    pub stage: Stage,
    pub iteration: usize,
    pub loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub precision: PrecisionKind,
    pub iterations: usize,
    pub evaluations: usize,
    pub final_loss: f64,
    pub stop: StopReason,
}

/// Terminal state of a calibration at the refinement precision.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome<F> {
    pub parameters: ModelParameters<F>,
    pub coefficients: CoefficientSet<F>,
    pub loss: F,
    pub stage_a: StageReport,
    pub stage_b: StageReport,
    pub trace: Vec<ProgressPoint>,
}

/// Precision-erased view of a [`CalibrationOutcome`] for callers that selected
/// precisions at run time.
#[derive(Debug, Clone)]
pub struct CalibrationSummary {
    pub parameters: ModelParameters<f64>,
    pub coefficients: CoefficientSet<f64>,
    pub loss: f64,
    pub stage_a: StageReport,
    pub stage_b: StageReport,
    pub trace: Vec<ProgressPoint>,
}

impl<F: Precision> CalibrationOutcome<F> {
    pub fn summary(&self) -> CalibrationSummary {
        CalibrationSummary {
            parameters: self.parameters.to_f64(),
            coefficients: self.coefficients.to_f64(),
            loss: self.loss.as_f64(),
            stage_a: self.stage_a,
            stage_b: self.stage_b,
            trace: self.trace.clone(),
        }
    }
}
