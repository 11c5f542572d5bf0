//! Closed-form homogenization of a two-layer laminate.
//!
//! Each layer contributes five quantities which are mixed linearly by volume
//! fraction (`d2 = 1 - d1`):
//!
//!   den   = Σ d_i (1+ν_i)(1−2ν_i) / (E_i (1−ν_i))     normal compliance
//!   vbar  = Σ d_i ν_i / (1−ν_i)                       Poisson coupling
//!   plane = Σ d_i E_i / (1−ν_i²)                      in-plane stiffness
//!   sc    = Σ d_i (1+ν_i) / E_i                       shear compliance
//!   sh    = Σ d_i E_i / (1+ν_i)                       shear stiffness
//!
//! and the effective coefficients are
//!
//!   h1111 = plane + vbar²/den     h1133 = vbar/den     h3333 = 1/den
//!   h1313 = 1/(2 sc)              h1212 = sh/2
//!
//! Only arithmetic is used, so the partial derivatives below are exact.

use crate::precision::Precision;
use crate::types::{
    CalibrationError, CalibrationResult, CoefficientSet, Jacobian, ModelParameters,
    NUM_COEFFICIENTS, NUM_PARAMETERS,
};

/// Number of layer-averaged quantities.
pub const NUM_MIXED: usize = 5;

pub const DEN: usize = 0;
pub const VBAR: usize = 1;
pub const PLANE: usize = 2;
pub const SHEAR_COMPLIANCE: usize = 3;
pub const SHEAR: usize = 4;

// ─────────────────────────────────────────────────────────────
//  Per-layer terms
// ─────────────────────────────────────────────────────────────

/// One per-layer quantity and its partials w.r.t. the layer's E and ν.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerTerm<F> {
    pub value: F,
    pub d_e: F,
    pub d_nu: F,
}

/// The five per-layer quantities, in mixing order (`DEN`, `VBAR`, …).
pub fn layer_terms<F: Precision>(e: F, nu: F) -> [LayerTerm<F>; NUM_MIXED] {
    let one = F::one();
    let two = one + one;
    let a = one - nu;
    let b = one + nu;
    let c = one - two * nu;
    let m = one - nu * nu;

    let normal = b * c / (e * a);
    let coupling = nu / a;
    let plane = e / m;
    let shear_compliance = b / e;
    let shear = e / b;

    [
        // d/dν [(1+ν)(1−2ν)/(1−ν)] = 2ν(ν−2)/(1−ν)²
        LayerTerm {
            value: normal,
            d_e: -normal / e,
            d_nu: two * nu * (nu - two) / (a * a * e),
        },
        LayerTerm {
            value: coupling,
            d_e: F::zero(),
            d_nu: one / (a * a),
        },
        LayerTerm {
            value: plane,
            d_e: one / m,
            d_nu: two * e * nu / (m * m),
        },
        LayerTerm {
            value: shear_compliance,
            d_e: -shear_compliance / e,
            d_nu: one / e,
        },
        LayerTerm {
            value: shear,
            d_e: one / b,
            d_nu: -e / (b * b),
        },
    ]
}

// ─────────────────────────────────────────────────────────────
//  Volume-fraction mixing
// ─────────────────────────────────────────────────────────────

/// Layer-averaged quantities and their partials w.r.t. `[e1, nu1, e2, nu2, d1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixedTerms<F> {
    pub values: [F; NUM_MIXED],
    pub partials: [[F; NUM_PARAMETERS]; NUM_MIXED],
}

impl<F: Copy> MixedTerms<F> {
    pub fn den(&self) -> F {
        self.values[DEN]
    }

    pub fn vbar(&self) -> F {
        self.values[VBAR]
    }
}

pub fn mixed_terms<F: Precision>(params: &ModelParameters<F>) -> MixedTerms<F> {
    let d1 = params.d1;
    let d2 = params.d2();
    let l1 = layer_terms(params.e1, params.nu1);
    let l2 = layer_terms(params.e2, params.nu2);

    let mut values = [F::zero(); NUM_MIXED];
    let mut partials = [[F::zero(); NUM_PARAMETERS]; NUM_MIXED];
    for m in 0..NUM_MIXED {
        values[m] = d1 * l1[m].value + d2 * l2[m].value;
        partials[m] = [
            d1 * l1[m].d_e,
            d1 * l1[m].d_nu,
            d2 * l2[m].d_e,
            d2 * l2[m].d_nu,
            // ∂/∂d1 through d2 = 1 − d1
            l1[m].value - l2[m].value,
        ];
    }
    MixedTerms { values, partials }
}

// ─────────────────────────────────────────────────────────────
//  Domain checks
// ─────────────────────────────────────────────────────────────

fn nonzero<F: Precision>(value: F, quantity: &'static str) -> CalibrationResult<()> {
    if value == F::zero() {
        Err(CalibrationError::SingularModel { quantity })
    } else {
        Ok(())
    }
}

/// Reject parameters for which a per-layer divisor vanishes.
///
/// Nothing else is restricted: ν > 1, negative moduli and d1 outside [0, 1]
/// are evaluated as given.
pub fn validate_domain<F: Precision>(params: &ModelParameters<F>) -> CalibrationResult<()> {
    let one = F::one();
    let layers = [
        (params.e1, params.nu1, ["E1", "1 - nu1", "1 + nu1", "1 - nu1^2"]),
        (params.e2, params.nu2, ["E2", "1 - nu2", "1 + nu2", "1 - nu2^2"]),
    ];
    for (e, nu, [e_name, minus, plus, square]) in layers {
        nonzero(e, e_name)?;
        nonzero(one - nu, minus)?;
        nonzero(one + nu, plus)?;
        nonzero(one - nu * nu, square)?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Effective coefficients
// ─────────────────────────────────────────────────────────────

fn coefficients_from_mixed<F: Precision>(values: &[F; NUM_MIXED]) -> [F; NUM_COEFFICIENTS] {
    let one = F::one();
    let two = one + one;
    let half = F::lit(0.5);
    let [den, vbar, plane, shear_compliance, shear] = *values;
    [
        plane + vbar * vbar / den,
        vbar / den,
        one / (two * shear_compliance),
        half * shear,
        one / den,
    ]
}

/// ∂h_k / ∂(mixed quantity m), rows in coefficient order.
fn coefficient_sensitivities<F: Precision>(
    values: &[F; NUM_MIXED],
) -> [[F; NUM_MIXED]; NUM_COEFFICIENTS] {
    let zero = F::zero();
    let one = F::one();
    let two = one + one;
    let half = F::lit(0.5);
    let [den, vbar, _, shear_compliance, _] = *values;
    let den2 = den * den;
    [
        [-(vbar * vbar) / den2, two * vbar / den, one, zero, zero],
        [-vbar / den2, one / den, zero, zero, zero],
        [zero, zero, zero, -one / (two * shear_compliance * shear_compliance), zero],
        [zero, zero, zero, zero, half],
        [-one / den2, zero, zero, zero, zero],
    ]
}

fn checked_mixed<F: Precision>(params: &ModelParameters<F>) -> CalibrationResult<MixedTerms<F>> {
    validate_domain(params)?;
    let mixed = mixed_terms(params);
    nonzero(mixed.values[DEN], "den")?;
    nonzero(mixed.values[SHEAR_COMPLIANCE], "layer-averaged shear compliance")?;
    Ok(mixed)
}

/// Predicted effective coefficients.
pub fn predict<F: Precision>(params: &ModelParameters<F>) -> CalibrationResult<CoefficientSet<F>> {
    let mixed = checked_mixed(params)?;
    Ok(CoefficientSet::from_array(coefficients_from_mixed(&mixed.values)))
}

/// Predicted coefficients together with ∂h/∂θ.
pub fn predict_with_jacobian<F: Precision>(
    params: &ModelParameters<F>,
) -> CalibrationResult<(CoefficientSet<F>, Jacobian<F>)> {
    let mixed = checked_mixed(params)?;
    let coefficients = coefficients_from_mixed(&mixed.values);
    let sens = coefficient_sensitivities(&mixed.values);

    let mut jacobian = [[F::zero(); NUM_PARAMETERS]; NUM_COEFFICIENTS];
    for (k, row) in jacobian.iter_mut().enumerate() {
        for (j, entry) in row.iter_mut().enumerate() {
            let mut acc = F::zero();
            for m in 0..NUM_MIXED {
                acc = acc + sens[k][m] * mixed.partials[m][j];
            }
            *entry = acc;
        }
    }
    Ok((CoefficientSet::from_array(coefficients), jacobian))
}
