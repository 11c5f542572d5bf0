//! Stage A: Adam with bias-corrected moment estimates.
//!
//! Runs its full iteration budget.  There is no convergence test; the stage
//! only has to land somewhere the quasi-Newton refinement can start from.

use crate::precision::Precision;
use crate::types::{AdamOptions, CalibrationResult, ProgressPoint, Stage, StopReason};
use tracing::info;

/// Optimiser-internal state: first / second moment estimates and the running
/// powers β1ᵗ, β2ᵗ.
#[derive(Debug, Clone)]
pub struct AdamState<F> {
    pub first_moment: Vec<F>,
    pub second_moment: Vec<F>,
    beta1_power: F,
    beta2_power: F,
    pub steps: usize,
}

impl<F: Precision> AdamState<F> {
    pub fn new(dim: usize) -> Self {
        Self {
            first_moment: vec![F::zero(); dim],
            second_moment: vec![F::zero(); dim],
            beta1_power: F::one(),
            beta2_power: F::one(),
            steps: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adam<F> {
    learning_rate: F,
    beta1: F,
    beta2: F,
    epsilon: F,
    state: AdamState<F>,
}

impl<F: Precision> Adam<F> {
    pub fn new(opts: &AdamOptions, dim: usize) -> Self {
        Self {
            learning_rate: F::lit(opts.learning_rate),
            beta1: F::lit(opts.beta1),
            beta2: F::lit(opts.beta2),
            epsilon: F::lit(opts.epsilon),
            state: AdamState::new(dim),
        }
    }

    pub fn state(&self) -> &AdamState<F> {
        &self.state
    }

    /// One in-place update of `theta` from `grad`.
    ///
    ///   m ← β1 m + (1−β1) g          v ← β2 v + (1−β2) g²
    ///   θ ← θ − α m̂ / (√v̂ + ε)       m̂ = m/(1−β1ᵗ), v̂ = v/(1−β2ᵗ)
    pub fn step(&mut self, theta: &mut [F], grad: &[F]) {
        let one = F::one();
        let s = &mut self.state;
        s.steps += 1;
        s.beta1_power = s.beta1_power * self.beta1;
        s.beta2_power = s.beta2_power * self.beta2;
        let bias1 = one - s.beta1_power;
        let bias2 = one - s.beta2_power;

        for j in 0..theta.len() {
            let g = grad[j];
            s.first_moment[j] = self.beta1 * s.first_moment[j] + (one - self.beta1) * g;
            s.second_moment[j] = self.beta2 * s.second_moment[j] + (one - self.beta2) * g * g;
            let m_hat = s.first_moment[j] / bias1;
            let v_hat = s.second_moment[j] / bias2;
            theta[j] = theta[j] - self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

/// Result of the coarse stage.
#[derive(Debug, Clone, Copy)]
pub struct AdamOutcome<F> {
    /// Loss at the final parameters.
    pub loss: F,
    pub iterations: usize,
    pub evaluations: usize,
    pub stop: StopReason,
}

/// Run `opts.iterations` Adam updates on `theta`.
///
/// `evaluate` recomputes loss and gradient from scratch at the given point
/// (the gradient buffer is overwritten).  The loss seen at the start of every
/// `progress_interval`-th iteration is logged and appended to `trace`.
pub fn run_adam<F, E>(
    theta: &mut [F],
    opts: &AdamOptions,
    progress_interval: usize,
    mut evaluate: E,
    trace: &mut Vec<ProgressPoint>,
) -> CalibrationResult<AdamOutcome<F>>
where
    F: Precision,
    E: FnMut(&[F], &mut [F]) -> CalibrationResult<F>,
{
    let total = opts.iterations;
    let mut adam = Adam::new(opts, theta.len());
    let mut grad = vec![F::zero(); theta.len()];
    let mut evaluations = 0;

    for iteration in 1..=total {
        let loss = evaluate(theta, &mut grad)?;
        evaluations += 1;
        if iteration % progress_interval == 0 {
            info!("[{}, {iteration}/{total}] loss = {loss:.6e}", Stage::Adam);
            trace.push(ProgressPoint { stage: Stage::Adam, iteration, loss: loss.as_f64() });
        }
        adam.step(theta, &grad);
    }

    let loss = evaluate(theta, &mut grad)?;
    evaluations += 1;
    Ok(AdamOutcome {
        loss,
        iterations: total,
        evaluations,
        stop: StopReason::BudgetExhausted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_each_coordinate_by_the_learning_rate() {
        let opts = AdamOptions::default();
        let mut adam = Adam::<f64>::new(&opts, 3);
        let mut theta = vec![1.0, 2.0, 3.0];
        adam.step(&mut theta, &[10.0, -0.5, 0.0]);
        assert!((theta[0] - (1.0 - 1e-2)).abs() < 1e-9);
        assert!((theta[1] - (2.0 + 1e-2)).abs() < 1e-9);
        assert_eq!(theta[2], 3.0);
        assert_eq!(adam.state().steps, 1);
    }

    #[test]
    fn full_budget_is_spent_on_a_quadratic() {
        let opts = AdamOptions { iterations: 500, learning_rate: 0.1, ..AdamOptions::default() };
        let mut theta = vec![3.0_f64, -2.0];
        let mut trace = Vec::new();
        let out = run_adam(
            &mut theta,
            &opts,
            100,
            |x, g| {
                g[0] = 2.0 * x[0];
                g[1] = 2.0 * x[1];
                Ok(x[0] * x[0] + x[1] * x[1])
            },
            &mut trace,
        )
        .unwrap();
        assert_eq!(out.iterations, 500);
        assert_eq!(out.evaluations, 501);
        assert_eq!(out.stop, StopReason::BudgetExhausted);
        assert_eq!(trace.len(), 5);
        assert!(out.loss < 1e-2, "loss = {}", out.loss);
    }
}
