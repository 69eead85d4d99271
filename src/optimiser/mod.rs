// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gradient-based minimisation with a backtracking line search.
//!
//! An [`Optimiser`] is a small state machine: it starts
//! [`OptimiserStatus::Initialized`], is [`OptimiserStatus::Iterating`] while
//! steps are being taken, and ends in one of the terminal states. Each
//! accepted step strictly decreases the objective, so the current parameters
//! are always the best seen so far.

mod direction;
mod line_search;

use log::{debug, trace};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::{constants::*, objective::Objective, ImagerError};
use direction::Directions;
use line_search::LineSearch;

/// How search directions are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Polak-Ribière conjugate gradients, restarted periodically and
    /// whenever conjugacy is lost.
    ConjugateGradient,

    /// Limited-memory BFGS keeping `memory` corrections.
    Lbfgs { memory: usize },
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Lbfgs {
            memory: DEFAULT_LBFGS_MEMORY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimiserConfig {
    pub direction: Direction,

    /// Converged when the relative decrease of the objective is below this
    /// on `consecutive` accepted steps.
    pub ftol: f64,

    /// Converged when no gradient element is larger than this after an
    /// accepted step.
    pub gtol: f64,

    pub consecutive: u32,

    pub max_iterations: u32,

    /// The Armijo sufficient-decrease constant.
    pub armijo_c1: f64,

    /// Rejected trial steps are multiplied by this.
    pub shrink_factor: f64,

    /// The line search gives up after this many rejected trial steps.
    pub max_shrinks: u32,

    /// No parameter may change by more than this in one step.
    pub max_step: f64,

    /// Conjugate-gradient directions are reset to steepest descent at least
    /// this often.
    pub restart_interval: u32,
}

impl Default for OptimiserConfig {
    fn default() -> Self {
        OptimiserConfig {
            direction: Direction::default(),
            ftol: DEFAULT_FTOL,
            gtol: DEFAULT_GTOL,
            consecutive: DEFAULT_CONSECUTIVE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            armijo_c1: DEFAULT_ARMIJO_C1,
            shrink_factor: DEFAULT_SHRINK_FACTOR,
            max_shrinks: DEFAULT_MAX_SHRINKS,
            max_step: DEFAULT_MAX_STEP,
            restart_interval: DEFAULT_RESTART_INTERVAL,
        }
    }
}

impl OptimiserConfig {
    pub fn validate(&self) -> Result<(), ImagerError> {
        let problem = if !(self.ftol >= 0.0 && self.gtol >= 0.0) {
            Some("tolerances must not be negative")
        } else if self.consecutive == 0 {
            Some("at least one consecutive iteration is needed to converge")
        } else if !(self.armijo_c1 > 0.0 && self.armijo_c1 < 1.0) {
            Some("the Armijo constant must be in (0, 1)")
        } else if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            Some("the shrink factor must be in (0, 1)")
        } else if !(self.max_step > 0.0 && self.max_step.is_finite()) {
            Some("the maximum step must be positive")
        } else if self.restart_interval == 0 {
            Some("the restart interval must be positive")
        } else if matches!(self.direction, Direction::Lbfgs { memory: 0 }) {
            Some("L-BFGS needs to remember at least one correction")
        } else {
            None
        };
        match problem {
            Some(p) => Err(ImagerError::InvalidConfig(format!("Optimiser: {p}"))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum OptimiserStatus {
    Initialized,
    Iterating,
    Converged,
    MaxIterationsReached,
    LineSearchFailed,
}

impl OptimiserStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OptimiserStatus::Converged
                | OptimiserStatus::MaxIterationsReached
                | OptimiserStatus::LineSearchFailed
        )
    }
}

/// What an optimiser run ended with.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimiserOutcome {
    /// The best parameters found.
    pub x: Array1<f64>,
    pub value: f64,
    pub status: OptimiserStatus,

    /// The number of accepted steps.
    pub iterations: u32,

    /// The number of objective evaluations, including the first.
    pub evaluations: u32,
}

/// The step taken last, used to scale the next trial step.
#[derive(Debug, Clone, Copy)]
struct PreviousStep {
    alpha: f64,
    slope: f64,
}

pub struct Optimiser<'a, O: Objective + ?Sized> {
    objective: &'a O,
    config: OptimiserConfig,
    line_search: LineSearch,
    directions: Directions,
    status: OptimiserStatus,

    x: Array1<f64>,
    value: f64,
    gradient: Array1<f64>,

    iteration: u32,
    evaluations: u32,
    small_decreases: u32,
    previous: Option<PreviousStep>,
}

impl<'a, O: Objective + ?Sized> Optimiser<'a, O> {
    /// Evaluate `objective` at `x0`, ready to iterate.
    pub fn new(
        objective: &'a O,
        x0: Array1<f64>,
        config: OptimiserConfig,
    ) -> Result<Optimiser<'a, O>, ImagerError> {
        assert_eq!(
            x0.len(),
            objective.num_params(),
            "The starting point doesn't have the objective's number of parameters"
        );
        config.validate()?;
        let (value, gradient) = objective.value_and_gradient(x0.view())?;
        trace!("Initial objective: {value:e}");

        Ok(Optimiser {
            objective,
            config,
            line_search: LineSearch::new(&config),
            directions: Directions::new(&config),
            status: OptimiserStatus::Initialized,
            x: x0,
            value,
            gradient,
            iteration: 0,
            evaluations: 1,
            small_decreases: 0,
            previous: None,
        })
    }

    pub fn status(&self) -> OptimiserStatus {
        self.status
    }

    pub fn x(&self) -> ArrayView1<f64> {
        self.x.view()
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// The number of accepted steps so far.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// The largest element of the current gradient.
    pub fn gradient_norm(&self) -> f64 {
        inf_norm(self.gradient.view())
    }

    /// Take one step. Once a terminal status is reached, this does nothing.
    pub fn step(&mut self) -> Result<OptimiserStatus, ImagerError> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        if self.iteration >= self.config.max_iterations {
            self.status = OptimiserStatus::MaxIterationsReached;
            return Ok(self.status);
        }
        self.status = OptimiserStatus::Iterating;
        if !self.value.is_finite() {
            debug!("The objective is not finite ({}); giving up", self.value);
            self.status = OptimiserStatus::LineSearchFailed;
            return Ok(self.status);
        }

        let precond = self.objective.preconditioner(self.x.view());
        let (mut direction, mut steepest) =
            self.directions
                .next(self.gradient.view(), precond.as_ref(), self.iteration);
        let accepted = loop {
            let slope = self.gradient.dot(&direction);
            let accepted = if slope < 0.0 && slope.is_finite() {
                let initial_step = self.initial_step(direction.view(), slope, steepest);
                self.line_search
                    .backtrack(
                        self.objective,
                        self.x.view(),
                        self.value,
                        slope,
                        direction.view(),
                        initial_step,
                        &mut self.evaluations,
                    )?
                    .map(|step| (step, slope))
            } else {
                None
            };

            match accepted {
                Some(a) => break Some(a),
                None if steepest => break None,
                None => {
                    debug!(
                        "Iteration {}: no decrease along the search direction; retrying with steepest descent",
                        self.iteration + 1
                    );
                    direction = self
                        .directions
                        .restart(self.gradient.view(), precond.as_ref());
                    steepest = true;
                }
            }
        };

        let Some((step, slope)) = accepted else {
            debug!(
                "Iteration {}: the line search failed; keeping the objective at {:e}",
                self.iteration + 1,
                self.value
            );
            self.status = OptimiserStatus::LineSearchFailed;
            return Ok(self.status);
        };

        let relative_decrease =
            (self.value - step.value) / self.value.abs().max(step.value.abs()).max(1.0);
        self.directions.update(
            (&step.x - &self.x).view(),
            (&step.gradient - &self.gradient).view(),
        );
        self.previous = Some(PreviousStep {
            alpha: step.alpha,
            slope,
        });
        self.x = step.x;
        self.value = step.value;
        self.gradient = step.gradient;
        self.iteration += 1;

        if relative_decrease < self.config.ftol {
            self.small_decreases += 1;
        } else {
            self.small_decreases = 0;
        }
        let gradient_norm = self.gradient_norm();
        debug!(
            "Iteration {}: objective {:e}, step {:e}, max |gradient| {:e}",
            self.iteration, self.value, step.alpha, gradient_norm
        );

        self.status = if self.small_decreases >= self.config.consecutive
            || gradient_norm < self.config.gtol
        {
            OptimiserStatus::Converged
        } else if self.iteration >= self.config.max_iterations {
            OptimiserStatus::MaxIterationsReached
        } else {
            OptimiserStatus::Iterating
        };
        Ok(self.status)
    }

    /// Iterate until a terminal status is reached.
    pub fn run(mut self) -> Result<OptimiserOutcome, ImagerError> {
        while !self.step()?.is_terminal() {}
        Ok(self.into_outcome())
    }

    pub fn into_outcome(self) -> OptimiserOutcome {
        OptimiserOutcome {
            x: self.x,
            value: self.value,
            status: self.status,
            iterations: self.iteration,
            evaluations: self.evaluations,
        }
    }

    /// The first trial step along `direction`. Quasi-Newton directions are
    /// already scaled; otherwise the previous step's slope is matched. No
    /// parameter may move further than the maximum step.
    fn initial_step(&self, direction: ArrayView1<f64>, slope: f64, steepest: bool) -> f64 {
        let scaled = matches!(self.config.direction, Direction::Lbfgs { .. }) && !steepest;
        let alpha = match self.previous {
            Some(prev) if !scaled => prev.alpha * prev.slope / slope,
            _ => 1.0,
        };
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha
        } else {
            1.0
        };
        let largest = inf_norm(direction);
        if largest * alpha > self.config.max_step {
            self.config.max_step / largest
        } else {
            alpha
        }
    }
}

fn inf_norm(a: ArrayView1<f64>) -> f64 {
    a.iter().fold(0.0, |acc, &x| acc.max(x.abs()))
}
