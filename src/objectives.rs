//! Relative-error loss between predicted and measured coefficients.
//!
//!   L = Σ_k ((h_k − m_k) / m_k)²
//!
//! Targets are finite and strictly positive by construction
//! ([`MeasuredTargets`](crate::types::MeasuredTargets)), so the division is
//! always defined.

use crate::precision::Precision;
use crate::types::{CoefficientSet, NUM_COEFFICIENTS};

/// r_k = (h_k − m_k) / m_k
pub fn relative_residuals<F: Precision>(
    predicted: &CoefficientSet<F>,
    measured: &CoefficientSet<F>,
) -> CoefficientSet<F> {
    let h = predicted.as_array();
    let m = measured.as_array();
    let mut r = [F::zero(); NUM_COEFFICIENTS];
    for k in 0..NUM_COEFFICIENTS {
        r[k] = (h[k] - m[k]) / m[k];
    }
    CoefficientSet::from_array(r)
}

/// Sum of squared relative residuals, accumulated in coefficient order.
pub fn residual_loss<F: Precision>(
    predicted: &CoefficientSet<F>,
    measured: &CoefficientSet<F>,
) -> F {
    relative_residuals(predicted, measured)
        .as_array()
        .iter()
        .fold(F::zero(), |acc, &r| acc + r * r)
}
