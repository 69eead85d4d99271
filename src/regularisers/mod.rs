// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Penalties encoding what images are expected to look like.
//!
//! Every regulariser is a function of the image alone, to be minimised. Most
//! are normalised by a reference flux so that weights carry over between
//! sources of different brightness.

mod entropy;
mod moments;
mod polarimetric;
mod smoothness;
#[cfg(test)]
mod tests;

use log::trace;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    constants::{DEFAULT_ENTROPY_FLOOR, DEFAULT_SMOOTHING_EPSILON},
    image::{Image, Stokes},
    ImagerError,
};

/// The kinds of regulariser. Names match those used in imaging plans.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RegulariserKind {
    /// sum I ln(I / P) / F
    SimpleEntropy,

    /// sum (I ln(I / P) - I + P) / F
    GullSkilling,

    /// The summed magnitude of the differences between neighbouring pixels.
    TotalVariation,

    /// The summed squared differences between neighbouring pixels.
    TotalSquaredVariation,

    /// 0.5 sum (I - P)^2 / F^2; keeps the image close to the prior.
    Patch,

    /// The flux-weighted variance of pixel positions about the centroid.
    Compactness,

    /// sum I^2 r^2 / F^2, with r the distance from the image centre.
    SquaredCompactness,

    /// The summed magnitude of pixel values (sparsity).
    L1,

    /// The squared fractional difference between the image flux and the
    /// reference flux.
    Flux,

    /// The squared distance of the centroid from the image centre.
    Centroid,

    /// Penalises polarised intensity exceeding total intensity.
    PolFluxBound,

    /// The Holdaway-Wardle polarisation entropy; favours unpolarised pixels.
    PolEntropy,
}

impl RegulariserKind {
    /// The Stokes planes this regulariser is sensitive to.
    pub fn stokes(self) -> &'static [Stokes] {
        match self {
            RegulariserKind::PolFluxBound | RegulariserKind::PolEntropy => {
                &[Stokes::I, Stokes::Q, Stokes::U]
            }
            _ => &[Stokes::I],
        }
    }
}

/// Numerical settings shared by all regularisers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegulariserSettings {
    /// Pixels at or below this are clamped before logs are taken
    /// \[Jy/pixel\].
    pub entropy_floor: f64,

    /// The smoothing length keeping absolute values differentiable
    /// \[Jy/pixel\].
    pub epsilon: f64,
}

impl Default for RegulariserSettings {
    fn default() -> Self {
        RegulariserSettings {
            entropy_floor: DEFAULT_ENTROPY_FLOOR,
            epsilon: DEFAULT_SMOOTHING_EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegulariserEvaluation {
    pub value: f64,

    /// The gradient with respect to every pixel of every Stokes plane.
    pub gradient: Array3<f64>,

    /// The number of image pixels at or below the entropy floor.
    pub clamped: usize,
}

#[derive(Debug, Clone)]
pub enum Regulariser {
    SimpleEntropy {
        /// Stokes I of the prior, clamped to the floor.
        prior: Array2<f64>,
        flux: f64,
        floor: f64,

        /// How many prior pixels were clamped.
        prior_clamped: usize,
    },
    GullSkilling {
        prior: Array2<f64>,
        flux: f64,
        floor: f64,
        prior_clamped: usize,
    },
    Patch {
        /// Stokes I of the prior.
        prior: Array2<f64>,
        flux: f64,
    },
    TotalVariation {
        flux: f64,
        epsilon: f64,
    },
    TotalSquaredVariation {
        flux: f64,
    },
    Compactness,
    SquaredCompactness {
        flux: f64,
    },
    L1 {
        flux: f64,
        epsilon: f64,
    },
    Flux {
        flux: f64,
    },
    Centroid,
    PolFluxBound {
        flux: f64,
        epsilon: f64,
    },
    PolEntropy {
        flux: f64,
        floor: f64,
    },
}

impl Regulariser {
    /// `flux` is the reference flux \[Jy\]; entropies are measured relative to
    /// Stokes I of `prior`.
    pub fn new(
        kind: RegulariserKind,
        prior: &Image,
        flux: f64,
        settings: RegulariserSettings,
    ) -> Result<Regulariser, ImagerError> {
        if !(flux.is_finite() && flux > 0.0) {
            return Err(ImagerError::InvalidConfig(format!(
                "The {kind} regulariser needs a positive reference flux, got {flux}"
            )));
        }
        if settings.entropy_floor <= 0.0 || settings.epsilon <= 0.0 {
            return Err(ImagerError::InvalidConfig(
                "The entropy floor and smoothing length must be positive".to_string(),
            ));
        }

        let floor = settings.entropy_floor;
        let epsilon = settings.epsilon;
        let clamped_prior = || {
            let prior = prior.stokes_i();
            let prior_clamped = prior.iter().filter(|&&p| p <= floor).count();
            (prior.mapv(|p| p.max(floor)), prior_clamped)
        };
        let reg = match kind {
            RegulariserKind::SimpleEntropy => {
                let (prior, prior_clamped) = clamped_prior();
                Regulariser::SimpleEntropy {
                    prior,
                    flux,
                    floor,
                    prior_clamped,
                }
            }
            RegulariserKind::GullSkilling => {
                let (prior, prior_clamped) = clamped_prior();
                Regulariser::GullSkilling {
                    prior,
                    flux,
                    floor,
                    prior_clamped,
                }
            }
            RegulariserKind::Patch => Regulariser::Patch {
                prior: prior.stokes_i().to_owned(),
                flux,
            },
            RegulariserKind::TotalVariation => Regulariser::TotalVariation { flux, epsilon },
            RegulariserKind::TotalSquaredVariation => {
                Regulariser::TotalSquaredVariation { flux }
            }
            RegulariserKind::Compactness => Regulariser::Compactness,
            RegulariserKind::SquaredCompactness => Regulariser::SquaredCompactness { flux },
            RegulariserKind::L1 => Regulariser::L1 { flux, epsilon },
            RegulariserKind::Flux => Regulariser::Flux { flux },
            RegulariserKind::Centroid => Regulariser::Centroid,
            RegulariserKind::PolFluxBound => Regulariser::PolFluxBound { flux, epsilon },
            RegulariserKind::PolEntropy => Regulariser::PolEntropy { flux, floor },
        };
        Ok(reg)
    }

    pub fn kind(&self) -> RegulariserKind {
        match self {
            Regulariser::SimpleEntropy { .. } => RegulariserKind::SimpleEntropy,
            Regulariser::GullSkilling { .. } => RegulariserKind::GullSkilling,
            Regulariser::Patch { .. } => RegulariserKind::Patch,
            Regulariser::TotalVariation { .. } => RegulariserKind::TotalVariation,
            Regulariser::TotalSquaredVariation { .. } => RegulariserKind::TotalSquaredVariation,
            Regulariser::Compactness => RegulariserKind::Compactness,
            Regulariser::SquaredCompactness { .. } => RegulariserKind::SquaredCompactness,
            Regulariser::L1 { .. } => RegulariserKind::L1,
            Regulariser::Flux { .. } => RegulariserKind::Flux,
            Regulariser::Centroid => RegulariserKind::Centroid,
            Regulariser::PolFluxBound { .. } => RegulariserKind::PolFluxBound,
            Regulariser::PolEntropy { .. } => RegulariserKind::PolEntropy,
        }
    }

    /// The number of prior pixels that were at or below the entropy floor
    /// when this regulariser was made. Zero for non-entropic regularisers.
    pub fn clamped_prior_pixels(&self) -> usize {
        match self {
            Regulariser::SimpleEntropy { prior_clamped, .. }
            | Regulariser::GullSkilling { prior_clamped, .. } => *prior_clamped,
            _ => 0,
        }
    }

    pub fn evaluate(&self, image: &Image) -> Result<RegulariserEvaluation, ImagerError> {
        let mut gradient = Array3::zeros(image.dim());
        let stokes_i = image.stokes_i();
        let mut clamped = 0;

        let check_prior = |prior: &Array2<f64>| {
            if prior.dim() == stokes_i.dim() {
                Ok(())
            } else {
                let (ny, nx) = prior.dim();
                Err(ImagerError::ShapeMismatch {
                    context: format!("the {} regulariser", self.kind()),
                    expected: (image.dim().0, ny, nx),
                    got: image.dim(),
                })
            }
        };

        let value = match self {
            Regulariser::SimpleEntropy {
                prior, flux, floor, ..
            }
            | Regulariser::GullSkilling {
                prior, flux, floor, ..
            } => {
                check_prior(prior)?;
                let gull_skilling = matches!(self, Regulariser::GullSkilling { .. });
                let (value, n) = entropy::entropy(
                    stokes_i,
                    prior.view(),
                    *floor,
                    gull_skilling,
                    gradient.index_axis_mut(Axis(0), 0),
                );
                clamped = n;
                value / flux
            }

            Regulariser::Patch { prior, flux } => {
                check_prior(prior)?;
                entropy::patch(stokes_i, prior.view(), gradient.index_axis_mut(Axis(0), 0))
                    / flux.powi(2)
            }

            Regulariser::TotalVariation { flux, epsilon } => {
                smoothness::total_variation(
                    stokes_i,
                    *epsilon,
                    gradient.index_axis_mut(Axis(0), 0),
                ) / flux
            }

            Regulariser::TotalSquaredVariation { flux } => {
                smoothness::total_squared_variation(stokes_i, gradient.index_axis_mut(Axis(0), 0))
                    / flux.powi(2)
            }

            Regulariser::Compactness => {
                moments::compactness(stokes_i, gradient.index_axis_mut(Axis(0), 0))
            }

            Regulariser::SquaredCompactness { flux } => moments::squared_compactness(
                stokes_i,
                *flux,
                gradient.index_axis_mut(Axis(0), 0),
            ),

            Regulariser::L1 { flux, epsilon } => {
                entropy::l1(stokes_i, *epsilon, gradient.index_axis_mut(Axis(0), 0)) / flux
            }

            Regulariser::Flux { flux } => {
                moments::flux(stokes_i, *flux, gradient.index_axis_mut(Axis(0), 0))
            }

            Regulariser::Centroid => {
                moments::centroid(stokes_i, gradient.index_axis_mut(Axis(0), 0))
            }

            Regulariser::PolFluxBound { flux, epsilon } => {
                let planes = polarimetric::PolPlanes::new(image, self.kind())?;
                polarimetric::pol_flux_bound(&planes, *epsilon, &mut gradient) / flux.powi(2)
            }

            Regulariser::PolEntropy { flux, floor } => {
                let planes = polarimetric::PolPlanes::new(image, self.kind())?;
                let (value, n) = polarimetric::pol_entropy(&planes, *floor, &mut gradient);
                clamped = n;
                value / flux
            }
        };

        // Normalise the gradient the same way as the value.
        match self {
            Regulariser::SimpleEntropy { flux, .. }
            | Regulariser::GullSkilling { flux, .. }
            | Regulariser::TotalVariation { flux, .. }
            | Regulariser::L1 { flux, .. }
            | Regulariser::PolEntropy { flux, .. } => gradient /= *flux,
            Regulariser::TotalSquaredVariation { flux }
            | Regulariser::Patch { flux, .. }
            | Regulariser::PolFluxBound { flux, .. } => gradient /= flux.powi(2),
            Regulariser::Compactness
            | Regulariser::SquaredCompactness { .. }
            | Regulariser::Flux { .. }
            | Regulariser::Centroid => (),
        }

        trace!("{} regulariser: {value:e}", self.kind());
        Ok(RegulariserEvaluation {
            value,
            gradient,
            clamped,
        })
    }
}
