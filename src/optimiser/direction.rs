// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Search directions.

use std::collections::VecDeque;

use log::trace;
use ndarray::prelude::*;

use super::{Direction, OptimiserConfig};

/// Powell's restart test: conjugate gradients restart when successive
/// (preconditioned) gradients are further from orthogonal than this.
const POWELL_THRESHOLD: f64 = 0.2;

/// L-BFGS corrections with less curvature than this (relative to |y|^2) are
/// not stored.
const MIN_CURVATURE: f64 = 1e-10;

struct CgHistory {
    gradient: Array1<f64>,

    /// The preconditioned gradient.
    precond_gradient: Array1<f64>,
    direction: Array1<f64>,
}

/// An L-BFGS correction pair.
struct Correction {
    s: Array1<f64>,
    y: Array1<f64>,
    rho: f64,
}

pub(super) enum Directions {
    ConjugateGradient {
        restart_interval: u32,
        since_restart: u32,
        history: Option<CgHistory>,
    },
    Lbfgs {
        memory: usize,
        history: VecDeque<Correction>,
    },
}

fn precondition(gradient: ArrayView1<f64>, precond: Option<&Array1<f64>>) -> Array1<f64> {
    match precond {
        Some(m) => &gradient * m,
        None => gradient.to_owned(),
    }
}

impl Directions {
    pub(super) fn new(config: &OptimiserConfig) -> Directions {
        match config.direction {
            Direction::ConjugateGradient => Directions::ConjugateGradient {
                restart_interval: config.restart_interval,
                since_restart: 0,
                history: None,
            },
            Direction::Lbfgs { memory } => Directions::Lbfgs {
                memory,
                history: VecDeque::with_capacity(memory),
            },
        }
    }

    /// The next search direction, and whether it is plain (preconditioned)
    /// steepest descent.
    pub(super) fn next(
        &mut self,
        gradient: ArrayView1<f64>,
        precond: Option<&Array1<f64>>,
        iteration: u32,
    ) -> (Array1<f64>, bool) {
        match self {
            Directions::ConjugateGradient {
                restart_interval,
                since_restart,
                history,
            } => {
                let z = precondition(gradient, precond);
                let beta = match history.as_ref() {
                    Some(prev) if *since_restart < *restart_interval => {
                        let gz = gradient.dot(&z);
                        if gradient.dot(&prev.precond_gradient).abs() >= POWELL_THRESHOLD * gz {
                            trace!("Iteration {}: conjugacy lost; restarting", iteration + 1);
                            None
                        } else {
                            // Polak-Ribiere, never negative.
                            let beta = (gz - gradient.dot(&prev.precond_gradient))
                                / prev.gradient.dot(&prev.precond_gradient);
                            beta.is_finite().then_some(beta.max(0.0))
                        }
                    }
                    _ => None,
                };

                let mut direction = -&z;
                match (beta, history.as_ref()) {
                    (Some(beta), Some(prev)) => {
                        direction.scaled_add(beta, &prev.direction);
                        *since_restart += 1;
                    }
                    _ => *since_restart = 1,
                }
                let steepest = *since_restart == 1;
                *history = Some(CgHistory {
                    gradient: gradient.to_owned(),
                    precond_gradient: z,
                    direction: direction.clone(),
                });
                (direction, steepest)
            }

            Directions::Lbfgs { history, .. } => {
                if history.is_empty() {
                    return (-precondition(gradient, precond), true);
                }

                // The two-loop recursion.
                let mut q = gradient.to_owned();
                let mut alphas = Vec::with_capacity(history.len());
                for c in history.iter().rev() {
                    let alpha = c.rho * c.s.dot(&q);
                    q.scaled_add(-alpha, &c.y);
                    alphas.push(alpha);
                }
                let mut r = match (precond, history.back()) {
                    (Some(m), _) => &q * m,
                    (None, Some(last)) => &q * (last.s.dot(&last.y) / last.y.dot(&last.y)),
                    (None, None) => q,
                };
                for (c, alpha) in history.iter().zip(alphas.into_iter().rev()) {
                    let beta = c.rho * c.y.dot(&r);
                    r.scaled_add(alpha - beta, &c.s);
                }
                (-r, false)
            }
        }
    }

    /// Forget all history and return the steepest-descent direction.
    pub(super) fn restart(
        &mut self,
        gradient: ArrayView1<f64>,
        precond: Option<&Array1<f64>>,
    ) -> Array1<f64> {
        let z = precondition(gradient, precond);
        let direction = -&z;
        match self {
            Directions::ConjugateGradient {
                since_restart,
                history,
                ..
            } => {
                *since_restart = 1;
                *history = Some(CgHistory {
                    gradient: gradient.to_owned(),
                    precond_gradient: z,
                    direction: direction.clone(),
                });
            }
            Directions::Lbfgs { history, .. } => history.clear(),
        }
        direction
    }

    /// Record an accepted step `s` and the change in gradient `y` it caused.
    pub(super) fn update(&mut self, s: ArrayView1<f64>, y: ArrayView1<f64>) {
        if let Directions::Lbfgs { memory, history } = self {
            let sy = s.dot(&y);
            let yy = y.dot(&y);
            if !(sy > MIN_CURVATURE * yy && yy > 0.0) {
                trace!("Skipping an L-BFGS correction without positive curvature");
                return;
            }
            if history.len() == *memory {
                history.pop_front();
            }
            history.push_back(Correction {
                s: s.to_owned(),
                y: y.to_owned(),
                rho: 1.0 / sy,
            });
        }
    }
}
