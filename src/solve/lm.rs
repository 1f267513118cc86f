//!
//! A small Levenberg-Marquardt driver over problems that assemble their own normal equations
//!

use nalgebra::{DMatrix, DVector};

use super::{SolveError, SolveOptions};

/// Damping beyond which no step is considered possible
const MAX_LAMBDA: f64 = 1e16;
const MIN_LAMBDA: f64 = 1e-15;
const INITIAL_LAMBDA: f64 = 1e-3;

/// Sum of squared residuals over the points that could be evaluated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost {
    pub sum_sq: f64,
    pub points: usize,
}
impl Cost {
    pub fn is_finite(&self) -> bool {
        self.sum_sq.is_finite()
    }
}

/// A linearization of a problem around one state
pub trait NormalEquations {
    /// Cost at the linearization point
    fn cost(&self) -> Cost;

    /// Largest absolute component of `J^T r`
    fn gradient_max(&self) -> f64;

    /// Solve `(J^T J + lambda D) delta = -J^T r` with Marquardt scaling `D`
    ///
    /// Returns `None` when the damped system is not positive definite.
    fn solve_damped(&self, lambda: f64) -> Option<DVector<f64>>;
}

/// Smallest diagonal entry damping scales with, so zero columns still get damped
pub fn damping_floor(max_diag: f64) -> f64 {
    (max_diag * 1e-12).max(f64::MIN_POSITIVE)
}

/// Dense `J^T J`, `J^T r` and the cost they were linearized at
#[derive(Debug, Clone)]
pub struct DenseEquations {
    pub jtj: DMatrix<f64>,
    pub jtr: DVector<f64>,
    pub cost: Cost,
}
impl NormalEquations for DenseEquations {
    fn cost(&self) -> Cost {
        self.cost
    }

    fn gradient_max(&self) -> f64 {
        self.jtr.amax()
    }

    fn solve_damped(&self, lambda: f64) -> Option<DVector<f64>> {
        let n = self.jtr.len();
        let floor = damping_floor(self.jtj.diagonal().max());

        let mut a = self.jtj.clone();
        for i in 0..n {
            a[(i, i)] += lambda * self.jtj[(i, i)].max(floor);
        }
        a.cholesky().map(|chol| chol.solve(&-&self.jtr))
    }
}

/// A nonlinear least-squares problem over a (possibly non-Euclidean) state
pub trait LeastSquaresProblem {
    type State: Clone;
    type Equations: NormalEquations;

    /// Evaluate the cost at `state`
    fn cost(&self, state: &Self::State) -> Cost;

    /// Linearize the residuals at `state`
    fn normal_equations(&self, state: &Self::State) -> Self::Equations;

    /// Apply an increment to `state`
    fn retract(&self, state: &Self::State, delta: &DVector<f64>) -> Self::State;

    /// Magnitude of the state, used for the relative step criterion
    fn norm(&self, state: &Self::State) -> f64;
}

/// Why the optimization stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Relative cost decrease fell below `ftol`
    Cost,
    /// Step fell below `xtol`
    Step,
    /// Gradient fell below `gtol`
    Gradient,
    /// No damped step decreases the cost any more
    Stalled,
    IterationLimit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub initial_cost: Cost,
    pub final_cost: Cost,
    pub termination: Termination,
    /// Relative cost decrease of the last accepted step
    pub last_decrease: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct LevenbergMarquardt {
    opts: SolveOptions,
}
impl LevenbergMarquardt {
    pub const fn new(opts: SolveOptions) -> Self {
        Self { opts }
    }

    /// Minimize `problem` starting from `state`
    ///
    /// Steps that lose evaluable points are rejected like steps that increase the cost.
    pub fn minimize<P: LeastSquaresProblem>(
        &self,
        problem: &P,
        mut state: P::State,
    ) -> Result<(P::State, SolveReport), SolveError> {
        let mut eqs = problem.normal_equations(&state);
        let mut cost = eqs.cost();
        if !cost.is_finite() {
            return Err(SolveError::NonFinite);
        }

        let initial_cost = cost;
        let mut lambda = INITIAL_LAMBDA;
        let mut last_decrease = f64::INFINITY;
        let mut iterations = 0;

        let termination = 'outer: loop {
            if iterations >= self.opts.max_iterations {
                break Termination::IterationLimit;
            }
            iterations += 1;

            if cost.sum_sq <= f64::MIN_POSITIVE || eqs.gradient_max() <= self.opts.gtol {
                break Termination::Gradient;
            }

            loop {
                let Some(delta) = eqs.solve_damped(lambda) else {
                    lambda *= 10.0;
                    if lambda > MAX_LAMBDA {
                        return Err(SolveError::Singular);
                    }
                    continue;
                };
                if !delta.iter().all(|v| v.is_finite()) {
                    return Err(SolveError::NonFinite);
                }

                let x_norm = problem.norm(&state);
                if delta.norm() <= self.opts.xtol * (x_norm + self.opts.xtol) {
                    break 'outer Termination::Step;
                }

                let candidate = problem.retract(&state, &delta);
                let next = problem.cost(&candidate);

                if next.is_finite() && next.points >= cost.points && next.sum_sq < cost.sum_sq {
                    last_decrease = (cost.sum_sq - next.sum_sq) / cost.sum_sq;
                    state = candidate;
                    eqs = problem.normal_equations(&state);
                    cost = eqs.cost();
                    lambda = (lambda / 10.0).max(MIN_LAMBDA);

                    if last_decrease < self.opts.ftol {
                        break 'outer Termination::Cost;
                    }
                    break;
                }

                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    break 'outer Termination::Stalled;
                }
            }
        };

        Ok((
            state,
            SolveReport {
                iterations,
                initial_cost,
                final_cost: cost,
                termination,
                last_decrease,
            },
        ))
    }
}
