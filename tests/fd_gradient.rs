//! Finite-difference checks for the hand-coded derivatives.
//!
//! Both the model Jacobian ∂h/∂θ and the loss gradient ∂L/∂θ are compared
//! component-wise against central differences
//!
//!     dF/dθ_i  ≈  [ F(θ + h eᵢ) − F(θ − h eᵢ) ] / 2h
//!
//! with a step scaled to each parameter's magnitude.  Points cover the seed,
//! a physically ordinary laminate, the Adam endpoint region and the
//! (unphysical) point that reproduces the reference targets.

use laminate::gradients::{loss, value_and_gradient};
use laminate::homogenization::predict_with_jacobian;
use laminate::types::*;

fn step(theta_i: f64) -> f64 {
    1e-6 * theta_i.abs().max(1.0)
}

fn loss_at(theta: &[f64], measured: &CoefficientSet<f64>) -> f64 {
    let mut g = vec![0.0; NUM_PARAMETERS];
    value_and_gradient(theta, measured, &mut g).unwrap()
}

/// Central-difference gradient test for the loss.
fn fd_gradient_check(theta: &[f64], tol_abs: f64, tol_rel: f64) {
    let measured = MeasuredTargets::reference().at_precision::<f64>();
    let n = theta.len();

    let mut grad_analytic = vec![0.0; n];
    value_and_gradient(theta, &measured, &mut grad_analytic).unwrap();

    let mut grad_fd = vec![0.0; n];
    let mut theta_plus = theta.to_vec();
    let mut theta_minus = theta.to_vec();
    for i in 0..n {
        let h = step(theta[i]);
        theta_plus[i] = theta[i] + h;
        theta_minus[i] = theta[i] - h;
        let f_plus = loss_at(&theta_plus, &measured);
        let f_minus = loss_at(&theta_minus, &measured);
        grad_fd[i] = (f_plus - f_minus) / (theta_plus[i] - theta_minus[i]);
        theta_plus[i] = theta[i];
        theta_minus[i] = theta[i];
    }

    eprintln!("──────────────────────────────────────────────");
    eprintln!("FD gradient check  at θ = {theta:?}");
    for i in 0..n {
        let abs_err = (grad_analytic[i] - grad_fd[i]).abs();
        let denom = grad_fd[i].abs().max(grad_analytic[i].abs()).max(1e-14);
        let rel_err = abs_err / denom;
        let flag = if abs_err > tol_abs && rel_err > tol_rel { " <<<" } else { "" };
        eprintln!(
            "  {:>4}  analytic={:+14.8e}  fd={:+14.8e}  abs={:.2e}  rel={:.2e}{flag}",
            PARAMETER_NAMES[i], grad_analytic[i], grad_fd[i], abs_err, rel_err,
        );
    }
    eprintln!("──────────────────────────────────────────────");

    for i in 0..n {
        let abs_err = (grad_analytic[i] - grad_fd[i]).abs();
        let denom = grad_fd[i].abs().max(grad_analytic[i].abs()).max(1e-14);
        let rel_err = abs_err / denom;
        assert!(
            abs_err < tol_abs || rel_err < tol_rel,
            "{}: analytic={:.8e}, fd={:.8e}, abs_err={:.3e}, rel_err={:.3e}",
            PARAMETER_NAMES[i], grad_analytic[i], grad_fd[i], abs_err, rel_err,
        );
    }
}

/// Central-difference test for every entry of ∂h/∂θ.
fn fd_jacobian_check(theta: &[f64], tol_abs: f64, tol_rel: f64) {
    let params = ModelParameters::from_slice(theta).unwrap();
    let (_, jacobian) = predict_with_jacobian(&params).unwrap();

    let mut worst = (0.0_f64, Coefficient::H1111, 0);
    for j in 0..NUM_PARAMETERS {
        let h = step(theta[j]);
        let mut plus = theta.to_vec();
        let mut minus = theta.to_vec();
        plus[j] += h;
        minus[j] -= h;
        let (hp, _) = predict_with_jacobian(&ModelParameters::from_slice(&plus).unwrap()).unwrap();
        let (hm, _) = predict_with_jacobian(&ModelParameters::from_slice(&minus).unwrap()).unwrap();
        for c in Coefficient::ALL {
            let fd = (hp[c] - hm[c]) / (plus[j] - minus[j]);
            let analytic = jacobian[c.index()][j];
            let abs_err = (analytic - fd).abs();
            let rel_err = abs_err / fd.abs().max(analytic.abs()).max(1e-14);
            if rel_err > worst.0 && abs_err > tol_abs {
                worst = (rel_err, c, j);
            }
            assert!(
                abs_err < tol_abs || rel_err < tol_rel,
                "∂{c}/∂{}: analytic={analytic:.8e}, fd={fd:.8e}, rel_err={rel_err:.3e}",
                PARAMETER_NAMES[j],
            );
        }
    }
    eprintln!(
        "FD Jacobian check: worst rel err {:.2e} at ∂{}/∂{}",
        worst.0, worst.1, PARAMETER_NAMES[worst.2]
    );
}

// ─────────────────────────────────────────────────────────────
//  Loss gradient
// ─────────────────────────────────────────────────────────────

#[test]
fn fd_gradient_at_seed() {
    fd_gradient_check(&ModelParameters::<f64>::seed().to_array(), 1e-8, 1e-5);
}

#[test]
fn fd_gradient_ordinary_laminate() {
    fd_gradient_check(&[120.0, 0.27, 15.0, 0.41, 0.35], 1e-8, 1e-5);
}

#[test]
fn fd_gradient_after_coarse_stage() {
    // near where single-precision Adam ends from the seed
    fd_gradient_check(&[96.6227, 0.275375, 195.896, 0.784483, 2.15929], 1e-8, 1e-5);
}

#[test]
fn fd_gradient_unphysical_region() {
    // ν > 1 and negative E, d1 < 0: still differentiable
    fd_gradient_check(&[-7.1, 1.098, 74.9, 0.317, -0.152], 1e-8, 1e-5);
}

#[test]
fn gradient_is_overwritten_not_accumulated() {
    let measured = MeasuredTargets::reference().at_precision::<f64>();
    let theta = ModelParameters::<f64>::seed().to_array();
    let mut fresh = vec![0.0; NUM_PARAMETERS];
    let mut dirty = vec![1e9; NUM_PARAMETERS];
    let a = value_and_gradient(&theta, &measured, &mut fresh).unwrap();
    let b = value_and_gradient(&theta, &measured, &mut dirty).unwrap();
    assert_eq!(a, b);
    assert_eq!(fresh, dirty);
}

#[test]
fn wrong_length_buffers_are_shape_errors() {
    let measured = MeasuredTargets::reference().at_precision::<f64>();
    let theta = ModelParameters::<f64>::seed().to_array();

    let mut grad = vec![0.0; NUM_PARAMETERS];
    let err = value_and_gradient(&theta[..4], &measured, &mut grad).unwrap_err();
    assert!(matches!(err, CalibrationError::Shape(_)), "{err}");

    let mut short = vec![0.0; 3];
    let err = value_and_gradient(&theta, &measured, &mut short).unwrap_err();
    assert!(matches!(err, CalibrationError::Shape(_)), "{err}");

    let err = loss(&theta[..2], &measured).unwrap_err();
    assert!(matches!(err, CalibrationError::Shape(_)), "{err}");
}

// ─────────────────────────────────────────────────────────────
//  Model Jacobian
// ─────────────────────────────────────────────────────────────

#[test]
fn fd_jacobian_at_seed() {
    fd_jacobian_check(&ModelParameters::<f64>::seed().to_array(), 1e-6, 1e-5);
}

#[test]
fn fd_jacobian_at_reference_solution() {
    fd_jacobian_check(
        &[-7.098699699594668, 1.0978944604914405, 74.87607627005956, 0.31689259330639696, -0.15193962190063554],
        1e-6,
        1e-5,
    );
}

#[test]
fn fd_jacobian_single_layer_limits() {
    fd_jacobian_check(&[70.0, 0.33, 210.0, 0.29, 1.0], 1e-6, 1e-5);
    fd_jacobian_check(&[70.0, 0.33, 210.0, 0.29, 0.0], 1e-6, 1e-5);
}
