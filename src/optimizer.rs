//! Two-stage calibration driver.
//!
//!   Init → Stage A (Adam, P1) → Escalate → Stage B (L-BFGS, P2) → Converged
//!
//! Stage A's parameters cross into stage B exactly once, as a fresh
//! `ModelParameters<P2>`; moments, curvature history and evaluation counters
//! all start cold on the far side.
//!
//! Stage B runs either the built-in strong-Wolfe L-BFGS ([`crate::lbfgs`]) or
//! argmin's `LBFGS` + `MoreThuenteLineSearch`, selected by
//! [`LineSearch`](crate::types::LineSearch).

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{CostFunction, Executor, Gradient, IterState, State, TerminationReason, KV};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use tracing::{debug, info, warn};

use crate::adam::run_adam;
use crate::gradients::{value_and_gradient, Evaluator};
use crate::homogenization::predict;
use crate::lbfgs::{minimize, LbfgsOutcome, LbfgsSettings};
use crate::objectives::residual_loss;
use crate::precision::{Precision, PrecisionKind, Widen};
use crate::types::{
    CalibrationError, CalibrationOptions, CalibrationOutcome, CalibrationResult,
    CalibrationSummary, LineSearch, MeasuredTargets, ModelParameters, PrecisionOptions,
    ProgressPoint, RefineOptions, Stage, StageReport, StopReason,
};

// ─────────────────────────────────────────────────────────────
//  argmin problem wrapper
// ─────────────────────────────────────────────────────────────

/// Adapts an [`Evaluator`] to argmin's `CostFunction` / `Gradient`.
///
/// argmin asks for cost and gradient separately at the same θ; the last
/// `(θ, loss, grad)` is cached so each unique θ is evaluated once and the
/// evaluator's counter stays meaningful.
struct ArgminProblem<'a, F> {
    evaluator: &'a RefCell<Evaluator<F>>,
    last_eval: RefCell<Option<(Vec<F>, F, Vec<F>)>>,
}

impl<'a, F: Precision> ArgminProblem<'a, F> {
    fn new(evaluator: &'a RefCell<Evaluator<F>>) -> Self {
        Self { evaluator, last_eval: RefCell::new(None) }
    }

    fn ensure_evaluated(&self, theta: &[F]) -> Result<(), argmin::core::Error> {
        {
            let cached = self.last_eval.borrow();
            if let Some((ref t, _, _)) = *cached {
                if t.as_slice() == theta {
                    return Ok(());
                }
            }
        }
        let mut grad = vec![F::zero(); theta.len()];
        let value = self.evaluator.borrow_mut().evaluate(theta, &mut grad)?;
        *self.last_eval.borrow_mut() = Some((theta.to_vec(), value, grad));
        Ok(())
    }

    fn cached<T>(&self, pick: impl FnOnce(&(Vec<F>, F, Vec<F>)) -> T) -> Result<T, argmin::core::Error> {
        self.last_eval
            .borrow()
            .as_ref()
            .map(pick)
            .ok_or_else(|| argmin::core::Error::msg("evaluation cache is empty"))
    }
}

impl<'a, F: Precision> CostFunction for ArgminProblem<'a, F> {
    type Param = Vec<F>;
    type Output = F;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.ensure_evaluated(theta)?;
        self.cached(|(_, value, _)| *value)
    }
}

impl<'a, F: Precision> Gradient for ArgminProblem<'a, F> {
    type Param = Vec<F>;
    type Gradient = Vec<F>;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        self.ensure_evaluated(theta)?;
        self.cached(|(_, _, grad)| grad.clone())
    }
}

/// Logs stage-B progress from inside the argmin executor.
struct ProgressObserver {
    total: usize,
    points: Arc<Mutex<Vec<ProgressPoint>>>,
}

impl ProgressObserver {
    fn record(&self, iteration: usize, loss: f64) {
        info!("[{}, {iteration}/{}] loss = {loss:.6e}", Stage::Lbfgs, self.total);
        if let Ok(mut points) = self.points.lock() {
            points.push(ProgressPoint { stage: Stage::Lbfgs, iteration, loss });
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Stage B backends
// ─────────────────────────────────────────────────────────────

/// A precision stage B can run in.
///
/// The argmin backend needs concrete `Vec<f32>` / `Vec<f64>` parameter types
/// to satisfy argmin-math's operator traits, hence one impl per float type.
pub trait Refine: Precision {
    /// argmin `LBFGS` with `MoreThuenteLineSearch`, starting from `theta`
    /// and leaving the best parameters found in it.
    fn refine_more_thuente(
        theta: &mut [Self],
        evaluator: &RefCell<Evaluator<Self>>,
        opts: &RefineOptions,
        progress_interval: usize,
        trace: &mut Vec<ProgressPoint>,
    ) -> CalibrationResult<LbfgsOutcome<Self>>;
}

/// argmin ends with `SolverConverged` on either its gradient-norm or its
/// cost-change test.  Only the former is convergence.
fn converged_or_stalled<F: Precision>(
    best: &[F],
    evaluator: &Evaluator<F>,
    tolerance_grad: f64,
) -> CalibrationResult<StopReason> {
    let mut grad = vec![F::zero(); best.len()];
    value_and_gradient(best, evaluator.measured(), &mut grad)?;
    let norm = grad.iter().fold(F::zero(), |acc, &g| acc + g * g).sqrt();
    if norm < F::lit(tolerance_grad) {
        Ok(StopReason::SolverConverged)
    } else {
        debug!(gradient_norm = %norm, "argmin cost test fired above the gradient tolerance");
        Ok(StopReason::CostStalled)
    }
}

macro_rules! impl_refine {
    ($t:ty) => {
        impl Observe<IterState<Vec<$t>, Vec<$t>, (), (), (), $t>> for ProgressObserver {
            fn observe_iter(
                &mut self,
                state: &IterState<Vec<$t>, Vec<$t>, (), (), (), $t>,
                _kv: &KV,
            ) -> Result<(), argmin::core::Error> {
                self.record(state.get_iter() as usize, state.get_cost().as_f64());
                Ok(())
            }
        }

        impl Refine for $t {
            fn refine_more_thuente(
                theta: &mut [$t],
                evaluator: &RefCell<Evaluator<$t>>,
                opts: &RefineOptions,
                progress_interval: usize,
                trace: &mut Vec<ProgressPoint>,
            ) -> CalibrationResult<LbfgsOutcome<$t>> {
                let problem = ArgminProblem::new(evaluator);
                let solver = LBFGS::new(MoreThuenteLineSearch::new(), opts.history_size)
                    .with_tolerance_grad(<$t as Precision>::lit(opts.tolerance_grad))?
                    .with_tolerance_cost(<$t as Precision>::lit(opts.tolerance_change))?;

                let points = Arc::new(Mutex::new(Vec::new()));
                let observer = ProgressObserver {
                    total: opts.max_iterations,
                    points: Arc::clone(&points),
                };

                let init_param = theta.to_vec();
                let result = Executor::new(problem, solver)
                    .configure(|config| {
                        config
                            .param(init_param)
                            .max_iters(opts.max_iterations as u64)
                            .target_cost(<$t>::NEG_INFINITY)
                    })
                    .add_observer(observer, ObserverMode::Every(progress_interval as u64))
                    .run()?;

                let state = result.state();
                let best = state.get_best_param().ok_or_else(|| {
                    CalibrationError::Solver("L-BFGS returned no best parameters".into())
                })?;
                theta.copy_from_slice(best);

                let stop = match state.get_termination_reason() {
                    Some(TerminationReason::MaxItersReached) => StopReason::MaxIterations,
                    Some(TerminationReason::SolverConverged | TerminationReason::TargetCostReached) => {
                        converged_or_stalled(best, &evaluator.borrow(), opts.tolerance_grad)?
                    }
                    Some(TerminationReason::SolverExit(reason)) => {
                        debug!(%reason, "argmin solver exit");
                        StopReason::LineSearchFailed
                    }
                    Some(reason @ (TerminationReason::Interrupt | TerminationReason::Timeout)) => {
                        return Err(CalibrationError::Solver(reason.text().to_string()));
                    }
                    None => {
                        return Err(CalibrationError::Solver("L-BFGS ended without a termination reason".into()));
                    }
                };
                if let Ok(mut recorded) = points.lock() {
                    trace.append(&mut recorded);
                }

                Ok(LbfgsOutcome {
                    loss: state.get_best_cost(),
                    iterations: state.get_iter() as usize,
                    evaluations: evaluator.borrow().evaluations(),
                    stop,
                })
            }
        }
    };
}

impl_refine!(f32);
impl_refine!(f64);

// ─────────────────────────────────────────────────────────────
//  Calibration pipeline
// ─────────────────────────────────────────────────────────────

/// One calibration run with stage A in `A` and stage B in `B`.
///
/// `A: Widen<B>` makes a narrowing escalation a compile error.
#[derive(Debug, Clone)]
pub struct Calibration<A, B> {
    targets: MeasuredTargets,
    seed: ModelParameters<A>,
    options: CalibrationOptions,
    _refine: PhantomData<B>,
}

impl<A, B> Calibration<A, B>
where
    A: Precision + Widen<B>,
    B: Refine,
{
    /// Validate everything up front: options, and that the model can be
    /// evaluated at the seed.  The precision fields of `options` are
    /// replaced by `A` and `B`.
    pub fn new(
        targets: MeasuredTargets,
        seed: &ModelParameters<f64>,
        mut options: CalibrationOptions,
    ) -> CalibrationResult<Self> {
        options.precision = PrecisionOptions { stage_a: A::KIND, stage_b: B::KIND };
        options.validate()?;
        let seed = ModelParameters::<A>::from_f64(seed);
        predict(&seed)?;
        Ok(Self { targets, seed, options, _refine: PhantomData })
    }

    pub fn options(&self) -> &CalibrationOptions {
        &self.options
    }

    pub fn run(&self) -> CalibrationResult<CalibrationOutcome<B>> {
        let opts = &self.options;
        let mut trace = Vec::new();

        // ── Stage A ──
        info!(
            precision = %A::KIND,
            iterations = opts.stage_a.iterations,
            learning_rate = opts.stage_a.learning_rate,
            "stage A: adam"
        );
        let mut coarse = self.seed.to_array();
        let mut evaluator = Evaluator::<A>::new(&self.targets, Stage::Adam);
        let adam = run_adam(
            &mut coarse,
            &opts.stage_a,
            opts.progress_interval,
            |theta, grad| evaluator.evaluate(theta, grad),
            &mut trace,
        )?;
        let stage_a = StageReport {
            stage: Stage::Adam,
            precision: A::KIND,
            iterations: adam.iterations,
            evaluations: adam.evaluations,
            final_loss: adam.loss.as_f64(),
            stop: adam.stop,
        };

        // ── Escalate ──
        let fine: ModelParameters<B> = ModelParameters::from_array(coarse).escalate();
        debug!(from = %A::KIND, to = %B::KIND, parameters = ?fine.to_f64(), "escalated");

        // ── Stage B ──
        info!(
            precision = %B::KIND,
            max_iterations = opts.stage_b.max_iterations,
            line_search = ?opts.stage_b.line_search,
            "stage B: lbfgs"
        );
        let mut theta = fine.to_array();
        let evaluator = RefCell::new(Evaluator::<B>::new(&self.targets, Stage::Lbfgs));
        let refined = match opts.stage_b.line_search {
            LineSearch::Wolfe => refine_wolfe(&mut theta, &evaluator, opts, &mut trace)?,
            LineSearch::MoreThuente => B::refine_more_thuente(
                &mut theta,
                &evaluator,
                &opts.stage_b,
                opts.progress_interval,
                &mut trace,
            )?,
        };
        if !refined.stop.converged() {
            warn!(stop = %refined.stop, loss = %refined.loss, "stage B stopped before meeting a tolerance");
        }
        let stage_b = StageReport {
            stage: Stage::Lbfgs,
            precision: B::KIND,
            iterations: refined.iterations,
            evaluations: refined.evaluations,
            final_loss: refined.loss.as_f64(),
            stop: refined.stop,
        };

        // ── Converged ──
        let parameters = ModelParameters::from_array(theta);
        let coefficients = predict(&parameters)?;
        let loss = residual_loss(&coefficients, evaluator.borrow().measured());
        info!(loss = %loss, stop = %stage_b.stop, "calibration finished");

        Ok(CalibrationOutcome { parameters, coefficients, loss, stage_a, stage_b, trace })
    }
}

fn refine_wolfe<F: Precision>(
    theta: &mut [F],
    evaluator: &RefCell<Evaluator<F>>,
    opts: &CalibrationOptions,
    trace: &mut Vec<ProgressPoint>,
) -> CalibrationResult<LbfgsOutcome<F>> {
    let settings = LbfgsSettings::from_options(&opts.stage_b);
    let total = opts.stage_b.max_iterations;
    let interval = opts.progress_interval;
    minimize(
        theta,
        &settings,
        |x, g| evaluator.borrow_mut().evaluate(x, g),
        |iteration, loss| {
            if iteration % interval == 0 {
                info!("[{}, {iteration}/{total}] loss = {loss:.6e}", Stage::Lbfgs);
                trace.push(ProgressPoint { stage: Stage::Lbfgs, iteration, loss: loss.as_f64() });
            }
        },
    )
}

/// Run a calibration with the precisions named in `options.precision`.
pub fn calibrate(
    targets: &MeasuredTargets,
    seed: &ModelParameters<f64>,
    options: &CalibrationOptions,
) -> CalibrationResult<CalibrationSummary> {
    use PrecisionKind::{Double, Single};

    options.validate()?;
    match (options.precision.stage_a, options.precision.stage_b) {
        (Single, Single) => run_summary::<f32, f32>(targets, seed, options),
        (Single, Double) => run_summary::<f32, f64>(targets, seed, options),
        (Double, Double) => run_summary::<f64, f64>(targets, seed, options),
        (Double, Single) => Err(CalibrationError::InvalidConfig(
            "stage B precision (single) is narrower than stage A precision (double)".into(),
        )),
    }
}

fn run_summary<A, B>(
    targets: &MeasuredTargets,
    seed: &ModelParameters<f64>,
    options: &CalibrationOptions,
) -> CalibrationResult<CalibrationSummary>
where
    A: Precision + Widen<B>,
    B: Refine,
{
    let outcome = Calibration::<A, B>::new(*targets, seed, options.clone())?.run()?;
    Ok(outcome.summary())
}
