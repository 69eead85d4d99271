// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interferometric measurements and the closure quantities derived from them.
//!
//! An [`Observation`] is supplied by whatever loaded or simulated the data; it
//! is never modified here. Before imaging, it is turned into a
//! [`FilteredObservation`], which only contains measurements that are safe to
//! divide by their noise.

mod closures;

pub use closures::{ClosureSelection, ClosureSet, Leg, Quadrangle, Triangle};

use hifitime::Epoch;
use log::debug;

use crate::{
    c64,
    image::{RADec, Stokes},
    ImagerError, ImagerWarning,
};

/// Polarimetric visibilities measured on the same baseline and at the same
/// time as a Stokes I visibility.
#[derive(Debug, Clone, PartialEq)]
pub struct PolVisibility {
    pub q: c64,
    pub u: c64,
    pub v: c64,
    pub sigma_q: f64,
    pub sigma_u: f64,
    pub sigma_v: f64,
}

impl PolVisibility {
    /// The first Stokes component whose noise estimate isn't positive, with
    /// that estimate.
    fn bad_noise(&self) -> Option<(Stokes, f64)> {
        [
            (Stokes::Q, self.sigma_q),
            (Stokes::U, self.sigma_u),
            (Stokes::V, self.sigma_v),
        ]
        .into_iter()
        .find(|&(_, sigma)| sigma <= 0.0)
    }
}

/// A single measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Visibility {
    pub time: Epoch,
    pub station1: String,
    pub station2: String,

    /// The spatial frequency coordinates \[wavelengths\].
    pub u: f64,
    pub v: f64,

    /// Stokes I visibility \[Jy\].
    pub vis: c64,

    /// The thermal noise of `vis` (per real/imaginary component) \[Jy\].
    pub sigma: f64,

    pub pol: Option<PolVisibility>,
}

impl Visibility {
    fn is_finite(&self) -> bool {
        let finite_pol = match &self.pol {
            None => true,
            Some(p) => {
                p.q.is_finite()
                    && p.u.is_finite()
                    && p.v.is_finite()
                    && p.sigma_q.is_finite()
                    && p.sigma_u.is_finite()
                    && p.sigma_v.is_finite()
            }
        };
        self.u.is_finite()
            && self.v.is_finite()
            && self.vis.is_finite()
            && self.sigma.is_finite()
            && finite_pol
    }

    /// The length of the baseline in the uv plane \[wavelengths\].
    pub fn uv_distance(&self) -> f64 {
        self.u.hypot(self.v)
    }
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub source: String,

    /// The observing frequency \[Hz\].
    pub freq_hz: f64,

    pub phase_centre: RADec,

    pub visibilities: Vec<Visibility>,
}

impl Observation {
    /// Drop any measurements that can't be used, reporting each one. A bad
    /// polarimetric noise estimate only drops the polarimetric values of a
    /// visibility.
    ///
    /// `systematic_noise` is a fraction of the visibility amplitude added in
    /// quadrature to each noise estimate.
    pub fn filtered(
        &self,
        systematic_noise: f64,
        warnings: &mut Vec<ImagerWarning>,
    ) -> Result<FilteredObservation, ImagerError> {
        if !(0.0..1.0).contains(&systematic_noise) {
            return Err(ImagerError::InvalidConfig(format!(
                "The systematic noise fraction must be in [0, 1), got {systematic_noise}"
            )));
        }

        let mut visibilities = Vec::with_capacity(self.visibilities.len());
        let mut original_indices = Vec::with_capacity(self.visibilities.len());
        for (index, vis) in self.visibilities.iter().enumerate() {
            if !vis.is_finite() {
                ImagerWarning::NonFiniteMeasurement { index }.emit(warnings);
                continue;
            }
            if vis.sigma <= 0.0 {
                ImagerWarning::BadNoise {
                    index,
                    station1: vis.station1.clone(),
                    station2: vis.station2.clone(),
                    sigma: vis.sigma,
                }
                .emit(warnings);
                continue;
            }

            let mut vis = vis.clone();
            if let Some((stokes, sigma)) = vis.pol.as_ref().and_then(PolVisibility::bad_noise) {
                ImagerWarning::BadPolNoise {
                    index,
                    stokes,
                    station1: vis.station1.clone(),
                    station2: vis.station2.clone(),
                    sigma,
                }
                .emit(warnings);
                vis.pol = None;
            }

            let inflate = |sigma: f64, value: c64| sigma.hypot(systematic_noise * value.norm());
            vis.sigma = inflate(vis.sigma, vis.vis);
            if let Some(pol) = vis.pol.as_mut() {
                pol.sigma_q = inflate(pol.sigma_q, pol.q);
                pol.sigma_u = inflate(pol.sigma_u, pol.u);
                pol.sigma_v = inflate(pol.sigma_v, pol.v);
            }
            visibilities.push(vis);
            original_indices.push(index);
        }

        if visibilities.is_empty() {
            return Err(ImagerError::InvalidObservation(format!(
                "none of the {} visibilities are usable",
                self.visibilities.len()
            )));
        }
        debug!(
            "{} of {} visibilities are usable",
            visibilities.len(),
            self.visibilities.len()
        );

        Ok(FilteredObservation {
            source: self.source.clone(),
            freq_hz: self.freq_hz,
            visibilities,
            original_indices,
        })
    }
}

/// An [`Observation`] with unusable measurements removed. Indices into
/// `visibilities` are what [`ClosureSet`]s and data terms refer to.
#[derive(Debug, Clone)]
pub struct FilteredObservation {
    pub source: String,
    pub freq_hz: f64,
    pub visibilities: Vec<Visibility>,

    /// The index of each kept visibility in the original [`Observation`].
    pub original_indices: Vec<usize>,
}

impl FilteredObservation {
    pub fn len(&self) -> usize {
        self.visibilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visibilities.is_empty()
    }

    /// The (u, v) coordinates of every visibility \[wavelengths\].
    pub fn uvs(&self) -> Vec<(f64, f64)> {
        self.visibilities.iter().map(|v| (v.u, v.v)).collect()
    }

    /// The shortest nonzero and longest baselines \[wavelengths\]. `None` if
    /// every baseline has zero length.
    pub fn uv_range(&self) -> Option<(f64, f64)> {
        let (min, max) = self
            .visibilities
            .iter()
            .map(Visibility::uv_distance)
            .filter(|&d| d > 0.0)
            .fold((f64::INFINITY, 0.0_f64), |(min, max), d| {
                (min.min(d), max.max(d))
            });
        (max > 0.0).then_some((min, max))
    }

    /// The largest Stokes I amplitude \[Jy\].
    pub fn max_amplitude(&self) -> f64 {
        self.visibilities
            .iter()
            .map(|v| v.vis.norm())
            .fold(0.0, f64::max)
    }
}
