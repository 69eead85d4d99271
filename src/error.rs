// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error and warning types for imaging.
//!
//! [`ImagerError`] is the *only* fatal error visible to callers; it is raised
//! for structural problems (bad shapes, missing polarisations, unusable
//! configuration). Problems with individual measurements or with a single
//! optimiser run are never fatal; they become [`ImagerWarning`]s that are
//! logged and returned alongside the reconstructed image.

use log::warn;
use thiserror::Error;

use crate::{continuation::ScheduleReadError, image::Stokes};

#[derive(Error, Debug)]
pub enum ImagerError {
    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}; this is a programmer error")]
    ShapeMismatch {
        context: String,
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },

    #[error("{needed_by} requires Stokes {stokes}, but the image doesn't have it")]
    MissingPolarisation { stokes: Stokes, needed_by: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    ScheduleRead(#[from] ScheduleReadError),
}

/// Something non-fatal that happened during reconstruction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImagerWarning {
    #[error("Visibility {index} ({station1}-{station2}) has a non-physical noise estimate ({sigma}); excluding it")]
    BadNoise {
        index: usize,
        station1: String,
        station2: String,
        sigma: f64,
    },

    #[error("Visibility {index} ({station1}-{station2}) has a non-physical Stokes {stokes} noise estimate ({sigma}); excluding its polarimetric values")]
    BadPolNoise {
        index: usize,
        stokes: Stokes,
        station1: String,
        station2: String,
        sigma: f64,
    },

    #[error("Visibility {index} has a non-finite coordinate or value; excluding it")]
    NonFiniteMeasurement { index: usize },

    #[error("{count} visibilities have no polarimetric values; they are excluded from {term}")]
    NoPolarimetry { count: usize, term: String },

    #[error("Stage {stage}: {count} pixel values were at or below the entropy floor ({floor:e}) and were clamped")]
    NonPositiveFlux {
        stage: usize,
        count: usize,
        floor: f64,
    },

    #[error("Stage {stage}: the line search failed after {iterations} iterations (retried: {retried})")]
    LineSearchFailure {
        stage: usize,
        iterations: u32,
        retried: bool,
    },

    #[error("Stage {stage}: did not converge within {max_iterations} iterations")]
    ConvergenceNotReached { stage: usize, max_iterations: u32 },

    #[error("{count} closure amplitudes had an SNR below {snr_cut} and were dropped")]
    ClosureSnrCut { count: usize, snr_cut: f64 },

    #[error("{count} measurements depend on a zero-amplitude visibility; they are excluded from {term}")]
    DegenerateMeasurement { count: usize, term: String },

    #[error("Pixel spacing ({pixel_spacing:e} rad) is larger than the smallest spatial wavelength ({smallest_wavelength:e} rad)")]
    PixelTooCoarse {
        pixel_spacing: f64,
        smallest_wavelength: f64,
    },

    #[error("Field of view ({fov:e} rad) is smaller than the largest nonzero spatial wavelength ({largest_wavelength:e} rad)")]
    FieldOfViewTooSmall { fov: f64, largest_wavelength: f64 },

    #[error("Prior flux ({flux} Jy) is outside 80-120% of the maximum visibility amplitude ({max_amp} Jy)")]
    FluxMismatch { flux: f64, max_amp: f64 },
}

impl ImagerWarning {
    /// Log this warning and keep it for the caller.
    pub(crate) fn emit(self, sink: &mut Vec<ImagerWarning>) {
        warn!("{self}");
        sink.push(self);
    }
}
