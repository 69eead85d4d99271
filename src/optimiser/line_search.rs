// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Backtracking line search with the Armijo sufficient-decrease condition.

use log::trace;
use ndarray::prelude::*;

use super::OptimiserConfig;
use crate::{objective::Objective, ImagerError};

pub(super) struct LineSearch {
    c1: f64,
    shrink_factor: f64,
    max_shrinks: u32,
}

/// A trial point satisfying the Armijo condition.
pub(super) struct AcceptedStep {
    pub(super) alpha: f64,
    pub(super) x: Array1<f64>,
    pub(super) value: f64,
    pub(super) gradient: Array1<f64>,
}

impl LineSearch {
    pub(super) fn new(config: &OptimiserConfig) -> LineSearch {
        LineSearch {
            c1: config.armijo_c1,
            shrink_factor: config.shrink_factor,
            max_shrinks: config.max_shrinks,
        }
    }

    /// Search from `x` (where the objective is `value`) along `direction`,
    /// on which the objective's slope is `slope` (negative). `None` if no
    /// acceptable step was found within the shrink budget. Every objective
    /// evaluation is counted in `evaluations`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn backtrack<O: Objective + ?Sized>(
        &self,
        objective: &O,
        x: ArrayView1<f64>,
        value: f64,
        slope: f64,
        direction: ArrayView1<f64>,
        initial_step: f64,
        evaluations: &mut u32,
    ) -> Result<Option<AcceptedStep>, ImagerError> {
        debug_assert!(slope < 0.0);
        let mut alpha = initial_step;
        for _ in 0..=self.max_shrinks {
            let mut trial = x.to_owned();
            trial.scaled_add(alpha, &direction);
            let (trial_value, gradient) = objective.value_and_gradient(trial.view())?;
            *evaluations += 1;

            if trial_value <= value + self.c1 * alpha * slope
                && gradient.iter().all(|g| g.is_finite())
            {
                return Ok(Some(AcceptedStep {
                    alpha,
                    x: trial,
                    value: trial_value,
                    gradient,
                }));
            }
            trace!("Rejected step {alpha:e}: {trial_value:e} vs. {value:e}");
            alpha *= self.shrink_factor;
        }
        Ok(None)
    }
}
