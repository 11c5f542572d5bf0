//! Hand-coded gradient of the relative-error loss.
//!
//! With r_k = (h_k − m_k)/m_k and L = Σ r_k²:
//!
//!   ∂L/∂θ_j = Σ_k (2 r_k / m_k) · ∂h_k/∂θ_j
//!
//! where ∂h/∂θ is the exact Jacobian from
//! [`predict_with_jacobian`](crate::homogenization::predict_with_jacobian).
//! No AD framework needed.

use crate::homogenization::{predict, predict_with_jacobian};
use crate::objectives::{relative_residuals, residual_loss};
use crate::precision::Precision;
use crate::types::{
    CalibrationError, CalibrationResult, CoefficientSet, MeasuredTargets, ModelParameters, Stage,
    NUM_COEFFICIENTS, NUM_PARAMETERS,
};

/// Loss only, at θ = `[e1, nu1, e2, nu2, d1]`.
pub fn loss<F: Precision>(theta: &[F], measured: &CoefficientSet<F>) -> CalibrationResult<F> {
    let predicted = predict(&ModelParameters::from_slice(theta)?)?;
    Ok(residual_loss(&predicted, measured))
}

/// Compute both L(θ) and ∇L(θ) in one pass.  `grad` is overwritten.
///
/// Steps:
///   1. Forward model + Jacobian
///   2. Relative residuals, loss
///   3. Chain rule through the residual weights 2 r_k / m_k
pub fn value_and_gradient<F: Precision>(
    theta: &[F],
    measured: &CoefficientSet<F>,
    grad: &mut [F],
) -> CalibrationResult<F> {
    let params = ModelParameters::from_slice(theta)?;
    if grad.len() != NUM_PARAMETERS {
        return Err(CalibrationError::Shape(format!(
            "gradient buffer has {} entries, expected {NUM_PARAMETERS}",
            grad.len()
        )));
    }
    let (predicted, jacobian) = predict_with_jacobian(&params)?;
    let residuals = relative_residuals(&predicted, measured);
    let r = residuals.as_array();
    let m = measured.as_array();
    let two = F::one() + F::one();

    grad.fill(F::zero());
    let mut total = F::zero();
    for k in 0..NUM_COEFFICIENTS {
        total = total + r[k] * r[k];
        let w = two * r[k] / m[k];
        for (g, &dh) in grad.iter_mut().zip(jacobian[k].iter()) {
            *g = *g + w * dh;
        }
    }
    Ok(total)
}

// ─────────────────────────────────────────────────────────────
//  Re-evaluation primitive shared by both stages
// ─────────────────────────────────────────────────────────────

/// Targets at one working precision plus an evaluation counter.
///
/// Every evaluation is checked for finiteness; a NaN or infinite loss or
/// gradient ends the run with [`CalibrationError::Divergence`].
#[derive(Debug, Clone)]
pub struct Evaluator<F> {
    measured: CoefficientSet<F>,
    stage: Stage,
    evaluations: usize,
}

impl<F: Precision> Evaluator<F> {
    pub fn new(targets: &MeasuredTargets, stage: Stage) -> Self {
        Self {
            measured: targets.at_precision(),
            stage,
            evaluations: 0,
        }
    }

    pub fn measured(&self) -> &CoefficientSet<F> {
        &self.measured
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn evaluate(&mut self, theta: &[F], grad: &mut [F]) -> CalibrationResult<F> {
        let value = value_and_gradient(theta, &self.measured, grad)?;
        self.evaluations += 1;
        if !value.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            return Err(CalibrationError::Divergence {
                stage: self.stage,
                evaluation: self.evaluations,
                loss: value.as_f64(),
            });
        }
        Ok(value)
    }
}
