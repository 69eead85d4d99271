// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Maximum-entropy image reconstruction for very-long-baseline interferometry
(VLBI).

An image is reconstructed from sparse, noisy visibilities by minimising a
weighted sum of data terms (chi-squared of visibilities, amplitudes, closure
quantities or polarimetric ratios) and regularisers (entropy, smoothness,
sparsity, moments). The minimisation is run as a schedule of stages; see
[`reconstruct`].
 */

pub mod cli;
pub mod constants;
pub mod continuation;
pub mod data_terms;
mod error;
pub mod image;
pub mod model;
pub mod objective;
pub mod observation;
pub mod optimiser;
pub mod regularisers;

use crossbeam_utils::atomic::AtomicCell;

/// Should progress bars be drawn? The library never sets this; binaries do.
pub static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);

#[allow(non_camel_case_types)]
pub type c64 = num_complex::Complex<f64>;

// Re-exports.
pub use cli::setup_logging;
pub use continuation::{
    reconstruct, reconstruct_with_progress, ContinuationSchedule, ImagerConfig, ImagingPlan,
    Progress, Reconstruction, StageConfig,
};
pub use error::{ImagerError, ImagerWarning};
pub use image::{Image, ImageGeometry, Stokes};
pub use observation::{Observation, Visibility};
