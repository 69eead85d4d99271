// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision.
 */

pub use std::f64::consts::{FRAC_PI_2, LN_2, PI, TAU};

/// Pixels at or below this value are clamped before an entropy is evaluated.
pub const DEFAULT_ENTROPY_FLOOR: f64 = 1e-20;

/// The smoothing length used to keep absolute values and total variation
/// differentiable at zero \[Jy/pixel\].
pub const DEFAULT_SMOOTHING_EPSILON: f64 = 1e-10;

/// The default relative-decrease stopping threshold of the optimiser.
pub const DEFAULT_FTOL: f64 = 1e-6;

/// The default gradient-norm stopping threshold of the optimiser.
pub const DEFAULT_GTOL: f64 = 1e-10;

/// The default maximum number of optimiser iterations per stage.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// The number of corrections kept by L-BFGS.
pub const DEFAULT_LBFGS_MEMORY: usize = 50;

/// The Armijo sufficient-decrease constant.
pub const DEFAULT_ARMIJO_C1: f64 = 1e-4;

/// The factor a trial step is multiplied by when it is rejected.
pub const DEFAULT_SHRINK_FACTOR: f64 = 0.5;

/// The maximum number of times a trial step can shrink before the line search
/// gives up.
pub const DEFAULT_MAX_SHRINKS: u32 = 30;

/// The largest change any single parameter may see in one step.
pub const DEFAULT_MAX_STEP: f64 = 1.0;

/// The conjugate-gradient direction is reset to steepest descent this often.
pub const DEFAULT_RESTART_INTERVAL: u32 = 20;

/// The number of consecutive small decreases required to declare convergence.
pub const DEFAULT_CONSECUTIVE: u32 = 2;

/// When a stage is retried after a line-search failure, its step bound is
/// multiplied by this.
pub const DEFAULT_RETRY_STEP_SCALE: f64 = 0.1;

/// Milliarcseconds to radians.
pub const MAS_TO_RAD: f64 = PI / (180.0 * 3600.0 * 1000.0);

/// Micro-arcseconds to radians.
pub const UAS_TO_RAD: f64 = MAS_TO_RAD / 1000.0;
