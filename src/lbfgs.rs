//! Stage B: limited-memory BFGS with a strong-Wolfe line search.
//!
//! Direction:   two-loop recursion over the last `history_size` curvature
//!              pairs (s, y), initial Hessian scale γ = sᵀy / yᵀy.
//! Step:        bracketing + zoom with safeguarded cubic interpolation,
//!              conditions f(t) ≤ f + c1 t gᵀd and |g(t)ᵀd| ≤ −c2 gᵀd.
//!
//! Pairs with sᵀy ≤ 1e-10 are skipped so the implicit Hessian stays
//! positive definite.

use std::collections::VecDeque;

use crate::precision::Precision;
use crate::types::{CalibrationResult, RefineOptions, StopReason};

/// Numeric settings at working precision.
#[derive(Debug, Clone, Copy)]
pub struct LbfgsSettings<F> {
    pub max_iterations: usize,
    pub max_evaluations: usize,
    pub tolerance_grad: F,
    pub tolerance_change: F,
    pub history_size: usize,
    pub learning_rate: F,
    /// Sufficient-decrease constant.
    pub c1: F,
    /// Curvature constant.
    pub c2: F,
    pub max_line_search: usize,
}

impl<F: Precision> LbfgsSettings<F> {
    pub fn from_options(opts: &RefineOptions) -> Self {
        Self {
            max_iterations: opts.max_iterations,
            max_evaluations: opts.max_evaluations,
            tolerance_grad: F::lit(opts.tolerance_grad),
            tolerance_change: F::lit(opts.tolerance_change),
            history_size: opts.history_size,
            learning_rate: F::one(),
            c1: F::lit(1e-4),
            c2: F::lit(0.9),
            max_line_search: 25,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LbfgsOutcome<F> {
    pub loss: F,
    pub iterations: usize,
    pub evaluations: usize,
    pub stop: StopReason,
}

#[derive(Debug, Clone)]
struct CurvaturePair<F> {
    s: Vec<F>,
    y: Vec<F>,
    rho: F,
}

/// One line-search probe at θ + t d.
#[derive(Debug, Clone)]
struct Trial<F> {
    step: F,
    loss: F,
    grad: Vec<F>,
    /// Directional derivative g(t)ᵀd.
    gtd: F,
}

fn dot<F: Precision>(a: &[F], b: &[F]) -> F {
    a.iter().zip(b).fold(F::zero(), |acc, (&x, &y)| acc + x * y)
}

fn max_abs<F: Precision>(a: &[F]) -> F {
    a.iter().fold(F::zero(), |acc, &x| acc.max(x.abs()))
}

fn l1_norm<F: Precision>(a: &[F]) -> F {
    a.iter().fold(F::zero(), |acc, &x| acc + x.abs())
}

/// Minimise from `theta` in place.
///
/// `evaluate` fills the gradient and returns the loss.  `on_iteration` is
/// called once per completed iteration with the 1-based index and new loss.
///
/// Termination, tested after each iteration in this order:
///   1. iteration budget
///   2. evaluation budget
///   3. ‖g‖∞ ≤ tolerance_grad
///   4. max |t d| ≤ tolerance_change
///   5. |f − f_prev| ≤ tolerance_change · |f_prev|
/// plus, before each line search, a search direction that is not a descent
/// direction (gᵀd ≥ 0).
pub fn minimize<F, E, P>(
    theta: &mut [F],
    settings: &LbfgsSettings<F>,
    mut evaluate: E,
    mut on_iteration: P,
) -> CalibrationResult<LbfgsOutcome<F>>
where
    F: Precision,
    E: FnMut(&[F], &mut [F]) -> CalibrationResult<F>,
    P: FnMut(usize, F),
{
    let n = theta.len();
    let mut grad = vec![F::zero(); n];
    let mut loss = evaluate(theta, &mut grad)?;
    let mut evaluations = 1;

    if max_abs(&grad) <= settings.tolerance_grad {
        return Ok(LbfgsOutcome {
            loss,
            iterations: 0,
            evaluations,
            stop: StopReason::GradientTolerance,
        });
    }

    let curvature_floor = F::lit(1e-10);
    let mut history: VecDeque<CurvaturePair<F>> = VecDeque::with_capacity(settings.history_size);
    let mut direction = vec![F::zero(); n];
    let mut prev_grad = vec![F::zero(); n];
    let mut step = F::zero();
    let mut h_diag = F::one();
    let mut iteration = 0;

    let stop = loop {
        iteration += 1;

        if iteration == 1 {
            for (d, &g) in direction.iter_mut().zip(&grad) {
                *d = -g;
            }
        } else {
            let y: Vec<F> = grad.iter().zip(&prev_grad).map(|(&g, &pg)| g - pg).collect();
            let s: Vec<F> = direction.iter().map(|&d| d * step).collect();
            let ys = dot(&y, &s);
            if ys > curvature_floor {
                if history.len() == settings.history_size {
                    history.pop_front();
                }
                h_diag = ys / dot(&y, &y);
                history.push_back(CurvaturePair { s, y, rho: F::one() / ys });
            }
            two_loop(&grad, &history, h_diag, &mut direction);
        }

        prev_grad.copy_from_slice(&grad);
        let prev_loss = loss;

        let initial_step = if iteration == 1 {
            F::one().min(F::one() / l1_norm(&grad)) * settings.learning_rate
        } else {
            settings.learning_rate
        };

        let gtd = dot(&grad, &direction);
        if gtd >= F::zero() {
            break StopReason::NonDescentDirection;
        }

        let (accepted, ls_evals) =
            strong_wolfe(&mut evaluate, theta, &direction, loss, &grad, gtd, initial_step, settings)?;
        evaluations += ls_evals;
        step = accepted.step;
        loss = accepted.loss;
        grad = accepted.grad;
        for (x, &d) in theta.iter_mut().zip(&direction) {
            *x = *x + step * d;
        }

        on_iteration(iteration, loss);

        if iteration == settings.max_iterations {
            break StopReason::MaxIterations;
        }
        if evaluations >= settings.max_evaluations {
            break StopReason::MaxEvaluations;
        }
        if max_abs(&grad) <= settings.tolerance_grad {
            break StopReason::GradientTolerance;
        }
        let largest_move = direction.iter().fold(F::zero(), |acc, &d| acc.max((step * d).abs()));
        if largest_move <= settings.tolerance_change {
            break StopReason::StepTolerance;
        }
        if (loss - prev_loss).abs() <= settings.tolerance_change * prev_loss.abs() {
            break StopReason::LossChange;
        }
    };

    Ok(LbfgsOutcome { loss, iterations: iteration, evaluations, stop })
}

/// d = −H g via the standard two-loop recursion.
fn two_loop<F: Precision>(grad: &[F], history: &VecDeque<CurvaturePair<F>>, h_diag: F, d: &mut [F]) {
    let mut q: Vec<F> = grad.iter().map(|&g| -g).collect();
    let mut alphas = vec![F::zero(); history.len()];

    for (i, pair) in history.iter().enumerate().rev() {
        alphas[i] = dot(&pair.s, &q) * pair.rho;
        for (qj, &yj) in q.iter_mut().zip(&pair.y) {
            *qj = *qj - alphas[i] * yj;
        }
    }

    for (dj, &qj) in d.iter_mut().zip(&q) {
        *dj = qj * h_diag;
    }

    for (i, pair) in history.iter().enumerate() {
        let beta = dot(&pair.y, d) * pair.rho;
        for (dj, &sj) in d.iter_mut().zip(&pair.s) {
            *dj = *dj + (alphas[i] - beta) * sj;
        }
    }
}

fn probe<F, E>(evaluate: &mut E, theta: &[F], direction: &[F], step: F) -> CalibrationResult<Trial<F>>
where
    F: Precision,
    E: FnMut(&[F], &mut [F]) -> CalibrationResult<F>,
{
    let point: Vec<F> = theta.iter().zip(direction).map(|(&x, &d)| x + step * d).collect();
    let mut grad = vec![F::zero(); theta.len()];
    let loss = evaluate(&point, &mut grad)?;
    let gtd = dot(&grad, direction);
    Ok(Trial { step, loss, grad, gtd })
}

/// Minimiser of the cubic through (x1, f1, g1) and (x2, f2, g2), clamped to
/// `bounds` (default: the interval spanned by x1, x2).  Falls back to the
/// midpoint of the bounds when the cubic has no real minimiser.
fn cubic_interpolate<F: Precision>(
    (x1, f1, g1): (F, F, F),
    (x2, f2, g2): (F, F, F),
    bounds: Option<(F, F)>,
) -> F {
    let (xmin, xmax) = match bounds {
        Some(b) => b,
        None if x1 <= x2 => (x1, x2),
        None => (x2, x1),
    };
    let two = F::lit(2.0);
    let three = F::lit(3.0);

    let d1 = g1 + g2 - three * (f1 - f2) / (x1 - x2);
    let d2_square = d1 * d1 - g1 * g2;
    if d2_square >= F::zero() {
        let d2 = d2_square.sqrt();
        let min_pos = if x1 <= x2 {
            x2 - (x2 - x1) * ((g2 + d2 - d1) / (g2 - g1 + two * d2))
        } else {
            x1 - (x1 - x2) * ((g1 + d2 - d1) / (g1 - g2 + two * d2))
        };
        min_pos.max(xmin).min(xmax)
    } else {
        (xmin + xmax) / two
    }
}

impl<F: Precision> Trial<F> {
    fn point(&self) -> (F, F, F) {
        (self.step, self.loss, self.gtd)
    }
}

/// Returns the accepted probe and the number of evaluations spent.
#[allow(clippy::too_many_arguments)]
fn strong_wolfe<F, E>(
    evaluate: &mut E,
    theta: &[F],
    direction: &[F],
    loss: F,
    grad: &[F],
    gtd: F,
    initial_step: F,
    settings: &LbfgsSettings<F>,
) -> CalibrationResult<(Trial<F>, usize)>
where
    F: Precision,
    E: FnMut(&[F], &mut [F]) -> CalibrationResult<F>,
{
    let c1 = settings.c1;
    let c2 = settings.c2;
    let max_ls = settings.max_line_search;
    let d_norm = max_abs(direction);
    let origin = Trial { step: F::zero(), loss, grad: grad.to_vec(), gtd };
    let sufficient = |t: F, f: F| f <= loss + c1 * t * gtd;

    let mut evaluations = 1;
    let mut current = probe(evaluate, theta, direction, initial_step)?;
    let mut previous = origin.clone();
    let mut ls_iter = 0;
    let mut done = false;

    // Bracketing
    let mut bracket = loop {
        if ls_iter >= max_ls {
            break vec![origin, current];
        }
        if !sufficient(current.step, current.loss) || (ls_iter > 1 && current.loss >= previous.loss) {
            break vec![previous, current];
        }
        if current.gtd.abs() <= -c2 * gtd {
            done = true;
            break vec![current];
        }
        if current.gtd >= F::zero() {
            break vec![previous, current];
        }

        let min_step = current.step + F::lit(0.01) * (current.step - previous.step);
        let max_step = current.step * F::lit(10.0);
        let next = cubic_interpolate(previous.point(), current.point(), Some((min_step, max_step)));
        previous = current;
        current = probe(evaluate, theta, direction, next)?;
        evaluations += 1;
        ls_iter += 1;
    };

    let last = bracket.len() - 1;
    let (mut lo, mut hi) = if bracket[0].loss <= bracket[last].loss { (0, 1) } else { (1, 0) };
    let mut insufficient_progress = false;

    // Zoom
    while !done && ls_iter < max_ls {
        if (bracket[1].step - bracket[0].step).abs() * d_norm < settings.tolerance_change {
            break;
        }

        let mut t = cubic_interpolate(bracket[0].point(), bracket[1].point(), None);
        let hi_step = bracket[0].step.max(bracket[1].step);
        let lo_step = bracket[0].step.min(bracket[1].step);
        let eps = F::lit(0.1) * (hi_step - lo_step);
        if (hi_step - t).min(t - lo_step) < eps {
            if insufficient_progress || t >= hi_step || t <= lo_step {
                t = if (t - hi_step).abs() < (t - lo_step).abs() {
                    hi_step - eps
                } else {
                    lo_step + eps
                };
                insufficient_progress = false;
            } else {
                insufficient_progress = true;
            }
        } else {
            insufficient_progress = false;
        }

        let trial = probe(evaluate, theta, direction, t)?;
        evaluations += 1;
        ls_iter += 1;

        if !sufficient(t, trial.loss) || trial.loss >= bracket[lo].loss {
            bracket[hi] = trial;
            (lo, hi) = if bracket[0].loss <= bracket[1].loss { (0, 1) } else { (1, 0) };
        } else {
            if trial.gtd.abs() <= -c2 * gtd {
                done = true;
            } else if trial.gtd * (bracket[hi].step - bracket[lo].step) >= F::zero() {
                bracket[hi] = bracket[lo].clone();
            }
            bracket[lo] = trial;
        }
    }

    Ok((bracket.swap_remove(lo), evaluations))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rosenbrock(x: &[f64], g: &mut [f64]) -> CalibrationResult<f64> {
        let (a, b) = (x[0], x[1]);
        let t = b - a * a;
        g[0] = -2.0 * (1.0 - a) - 400.0 * a * t;
        g[1] = 200.0 * t;
        Ok((1.0 - a) * (1.0 - a) + 100.0 * t * t)
    }

    fn settings() -> LbfgsSettings<f64> {
        LbfgsSettings::from_options(&RefineOptions::default())
    }

    #[test]
    fn cubic_interpolation_finds_the_parabola_vertex() {
        // f = (x − 1)², sampled at 0 and 3
        let t = cubic_interpolate((0.0_f64, 1.0, -2.0), (3.0, 4.0, 4.0), None);
        assert!((t - 1.0).abs() < 1e-12, "t = {t}");
    }

    #[test]
    fn cubic_interpolation_respects_bounds() {
        let t = cubic_interpolate((0.0_f64, 1.0, -2.0), (3.0, 4.0, 4.0), Some((2.0, 2.5)));
        assert_eq!(t, 2.0);
    }

    #[test]
    fn solves_rosenbrock() {
        let mut x = vec![-1.2, 1.0];
        let mut calls = 0;
        let out = minimize(&mut x, &settings(), rosenbrock, |_, _| calls += 1).unwrap();
        assert!(out.stop.converged(), "stop = {:?}", out.stop);
        assert!(out.loss < 1e-20, "loss = {}", out.loss);
        assert!((x[0] - 1.0).abs() < 1e-9 && (x[1] - 1.0).abs() < 1e-9, "x = {x:?}");
        assert_eq!(calls, out.iterations);
        assert!(out.evaluations > out.iterations);
    }

    #[test]
    fn stationary_start_stops_immediately() {
        let mut x = vec![1.0, 1.0];
        let out = minimize(&mut x, &settings(), rosenbrock, |_, _| {}).unwrap();
        assert_eq!(out.stop, StopReason::GradientTolerance);
        assert_eq!(out.iterations, 0);
        assert_eq!(out.evaluations, 1);
    }

    #[test]
    fn iteration_budget_is_reported() {
        let mut x = vec![-1.2, 1.0];
        let s = LbfgsSettings { max_iterations: 3, ..settings() };
        let out = minimize(&mut x, &s, rosenbrock, |_, _| {}).unwrap();
        assert_eq!(out.stop, StopReason::MaxIterations);
        assert_eq!(out.iterations, 3);
        assert!(!out.stop.converged());
    }

    #[test]
    fn evaluation_budget_is_reported() {
        let mut x = vec![-1.2, 1.0];
        let s = LbfgsSettings { max_evaluations: 5, ..settings() };
        let out = minimize(&mut x, &s, rosenbrock, |_, _| {}).unwrap();
        assert_eq!(out.stop, StopReason::MaxEvaluations);
        assert!(out.evaluations >= 5);
    }

    #[test]
    fn loss_change_tolerance_is_relative() {
        // 300 → 243: an absolute change of 57, a relative change of 0.19
        let mut x = vec![10.0];
        let s = LbfgsSettings::from_options(&RefineOptions {
            tolerance_change: 0.5,
            ..RefineOptions::default()
        });
        let out = minimize(
            &mut x,
            &s,
            |x: &[f64], g: &mut [f64]| {
                g[0] = 6.0 * x[0];
                Ok(3.0 * x[0] * x[0])
            },
            |_, _| {},
        )
        .unwrap();
        assert_eq!(out.stop, StopReason::LossChange);
        assert_eq!(out.iterations, 1);
        assert_eq!(x, vec![9.0]);
    }

    #[test]
    fn quadratic_is_solved_in_single_precision() {
        let mut x = vec![4.0_f32, -3.0, 0.5];
        let s = LbfgsSettings::<f32>::from_options(&RefineOptions {
            tolerance_grad: 1e-6,
            tolerance_change: 1e-9,
            ..RefineOptions::default()
        });
        let out = minimize(
            &mut x,
            &s,
            |x: &[f32], g: &mut [f32]| {
                let w = [1.0_f32, 10.0, 100.0];
                let mut f = 0.0;
                for j in 0..3 {
                    g[j] = 2.0 * w[j] * x[j];
                    f += w[j] * x[j] * x[j];
                }
                Ok(f)
            },
            |_, _| {},
        )
        .unwrap();
        assert!(out.stop.converged(), "stop = {:?}", out.stop);
        assert!(out.loss < 1e-8, "loss = {}", out.loss);
    }

    #[test]
    fn evaluation_errors_propagate() {
        let mut x = vec![-1.2, 1.0];
        let err = minimize(
            &mut x,
            &settings(),
            |_: &[f64], _: &mut [f64]| Err(crate::types::CalibrationError::Solver("boom".into())),
            |_, _| {},
        )
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
