// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Regularisers tying the polarised planes to Stokes I.
//!
//! Polarised intensity is sqrt(Q^2 + U^2 + V^2); Stokes V only contributes
//! if the image has it.

use ndarray::prelude::*;

use super::RegulariserKind;
use crate::{
    constants::LN_2,
    image::{Image, Stokes},
    ImagerError,
};

/// Fractional polarisations are capped just below one so the entropy stays
/// finite.
const MAX_FRACTION: f64 = 1.0 - 1e-12;

/// The planes of an image and their positions in its data cube.
pub(super) struct PolPlanes<'a> {
    i: ArrayView2<'a, f64>,
    pol: Vec<(usize, ArrayView2<'a, f64>)>,
}

impl<'a> PolPlanes<'a> {
    pub(super) fn new(
        image: &'a Image,
        kind: RegulariserKind,
    ) -> Result<PolPlanes<'a>, ImagerError> {
        let plane = |stokes: Stokes| -> Result<(usize, ArrayView2<'a, f64>), ImagerError> {
            let index = image
                .stokes_index(stokes)
                .ok_or_else(|| ImagerError::MissingPolarisation {
                    stokes,
                    needed_by: format!("The {kind} regulariser"),
                })?;
            Ok((index, image.data().index_axis_move(Axis(0), index)))
        };

        let mut pol = vec![plane(Stokes::Q)?, plane(Stokes::U)?];
        if image.stokes_index(Stokes::V).is_some() {
            pol.push(plane(Stokes::V)?);
        }
        Ok(PolPlanes {
            i: image.stokes_i(),
            pol,
        })
    }

    /// Polarised intensity squared at a pixel.
    fn p_sq(&self, pixel: (usize, usize)) -> f64 {
        self.pol.iter().map(|(_, plane)| plane[pixel].powi(2)).sum()
    }
}

/// sum max(p - I, 0)^2, with p smoothed by `epsilon`; unnormalised.
pub(super) fn pol_flux_bound(planes: &PolPlanes, epsilon: f64, grad: &mut Array3<f64>) -> f64 {
    let mut value = 0.0;
    for (pixel, &i) in planes.i.indexed_iter() {
        let p = (planes.p_sq(pixel) + epsilon * epsilon).sqrt();
        let excess = p - i;
        if excess <= 0.0 {
            continue;
        }
        value += excess * excess;
        grad[(0, pixel.0, pixel.1)] -= 2.0 * excess;
        for (index, plane) in &planes.pol {
            grad[(*index, pixel.0, pixel.1)] += 2.0 * excess * plane[pixel] / p;
        }
    }
    value
}

/// sum I (f(m) + ln 2), where m = p / I and
/// f(m) = ((1 + m) / 2) ln((1 + m) / 2) + ((1 - m) / 2) ln((1 - m) / 2);
/// unnormalised. Below `floor`, each pixel's term continues linearly in I
/// from its value at `floor`; the number of such pixels is returned with the
/// value.
pub(super) fn pol_entropy(
    planes: &PolPlanes,
    floor: f64,
    grad: &mut Array3<f64>,
) -> (f64, usize) {
    let x_ln_x = |x: f64| if x > 0.0 { x * x.ln() } else { 0.0 };

    let mut value = 0.0;
    let mut clamped = 0;
    for (pixel, &i) in planes.i.indexed_iter() {
        if i <= floor {
            clamped += 1;
        }
        let at = i.max(floor);
        // Zero unless I is below the floor.
        let below = i - at;
        let p = planes.p_sq(pixel).sqrt();
        let m = (p / at).min(MAX_FRACTION);
        let penalty = x_ln_x((1.0 + m) / 2.0) + x_ln_x((1.0 - m) / 2.0) + LN_2;
        let atanh_m = m.atanh();
        let d_i = penalty - m * atanh_m;
        value += at * penalty + below * d_i;

        grad[(0, pixel.0, pixel.1)] += d_i;
        if p > 0.0 {
            // d(d_i)/dp = -m / ((1 - m^2) I)
            let d_p = atanh_m - below * m / ((1.0 - m * m) * at);
            for (index, plane) in &planes.pol {
                grad[(*index, pixel.0, pixel.1)] += d_p * plane[pixel] / p;
            }
        }
    }
    (value, clamped)
}
