// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Code to predict visibilities from an image.
//!
//! This is a direct (non-uniform) discrete Fourier transform: every predicted
//! visibility is a sum over every pixel. The transform and its adjoint are
//! parallelised over the output elements; each output element is summed
//! serially, so results do not depend on the number of threads.


use std::f64::consts::PI;

use log::debug;
use ndarray::{parallel::prelude::*, prelude::*};
use serde::{Deserialize, Serialize};

use crate::{
    c64,
    image::{Image, ImageGeometry, Stokes},
    ImagerError,
};

/// Above this many phasors, phasors are computed on the fly rather than
/// cached (2^26 phasors is 1 GiB).
const MAX_CACHED_PHASORS: usize = 1 << 26;

/// The response of a single pixel in the uv plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pulse {
    /// Each pixel is a point.
    Delta,

    /// Each pixel is a pyramid as wide as two pixels; equivalent to linear
    /// interpolation between pixel centres.
    #[default]
    Triangle,
}

impl Pulse {
    fn response(self, u: f64, v: f64, pixel_size: f64) -> f64 {
        match self {
            Pulse::Delta => 1.0,
            Pulse::Triangle => (sinc(u * pixel_size) * sinc(v * pixel_size)).powi(2),
        }
    }
}

/// The normalised sinc function.
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

enum Phasors {
    /// The first dimension is visibility, the second is pixel.
    Cached(Array2<c64>),

    OnTheFly {
        uvs: Vec<(f64, f64)>,
        pixel_coords: Vec<(f64, f64)>,
        pulse: Pulse,
        pixel_size: f64,
    },
}

/// Maps image planes to visibilities at fixed (u, v) coordinates, and maps
/// visibility gradients back to pixel gradients.
pub struct ForwardModel {
    nx: usize,
    ny: usize,
    num_vis: usize,
    phasors: Phasors,
}

impl ForwardModel {
    /// `uvs` are spatial frequencies \[wavelengths\].
    pub fn new(geometry: &ImageGeometry, uvs: &[(f64, f64)], pulse: Pulse) -> ForwardModel {
        Self::with_cache_limit(geometry, uvs, pulse, MAX_CACHED_PHASORS)
    }

    fn with_cache_limit(
        geometry: &ImageGeometry,
        uvs: &[(f64, f64)],
        pulse: Pulse,
        cache_limit: usize,
    ) -> ForwardModel {
        let pixel_coords = geometry.pixel_coords();
        let num_pixels = pixel_coords.len();
        let pixel_size = geometry.pixel_size;

        let phasors = if uvs.len() * num_pixels <= cache_limit {
            let mut phasors = Array2::zeros((uvs.len(), num_pixels));
            phasors
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(uvs.par_iter())
                .for_each(|(mut row, &(u, v))| {
                    row.iter_mut()
                        .zip(pixel_coords.iter())
                        .for_each(|(phasor, &(x, y))| {
                            *phasor = phasor_at(u, v, x, y, pulse, pixel_size);
                        });
                });
            Phasors::Cached(phasors)
        } else {
            debug!(
                "{} visibilities x {} pixels is too many to cache; computing phasors on the fly",
                uvs.len(),
                num_pixels
            );
            Phasors::OnTheFly {
                uvs: uvs.to_vec(),
                pixel_coords,
                pulse,
                pixel_size,
            }
        };

        ForwardModel {
            nx: geometry.nx,
            ny: geometry.ny,
            num_vis: uvs.len(),
            phasors,
        }
    }

    pub fn num_vis(&self) -> usize {
        self.num_vis
    }

    pub fn num_pixels(&self) -> usize {
        self.nx * self.ny
    }

    /// Predict visibilities of a single image plane (shape `[ny][nx]`).
    pub fn forward(&self, plane: ArrayView2<f64>) -> Array1<c64> {
        assert_eq!(
            plane.dim(),
            (self.ny, self.nx),
            "plane.dim() != (self.ny, self.nx)"
        );

        let pixels: Vec<f64> = plane.iter().copied().collect();
        let vis: Vec<c64> = match &self.phasors {
            Phasors::Cached(phasors) => phasors
                .axis_iter(Axis(0))
                .into_par_iter()
                .map(|row| row.iter().zip(pixels.iter()).map(|(a, &p)| a * p).sum())
                .collect(),

            Phasors::OnTheFly {
                uvs,
                pixel_coords,
                pulse,
                pixel_size,
            } => uvs
                .par_iter()
                .map(|&(u, v)| {
                    pixel_coords
                        .iter()
                        .zip(pixels.iter())
                        .map(|(&(x, y), &p)| phasor_at(u, v, x, y, *pulse, *pixel_size) * p)
                        .sum()
                })
                .collect(),
        };
        Array1::from(vis)
    }

    /// Given the gradient of a real scalar with respect to each predicted
    /// visibility (d/dRe + i d/dIm), get the gradient with respect to each
    /// pixel. This is the real part of the conjugate-transposed transform.
    pub fn adjoint(&self, vis_grad: ArrayView1<c64>) -> Array2<f64> {
        assert_eq!(vis_grad.len(), self.num_vis, "vis_grad.len() != self.num_vis");

        let grad: Vec<f64> = match &self.phasors {
            Phasors::Cached(phasors) => phasors
                .axis_iter(Axis(1))
                .into_par_iter()
                .map(|column| {
                    column
                        .iter()
                        .zip(vis_grad.iter())
                        .map(|(a, g)| a.re * g.re + a.im * g.im)
                        .sum()
                })
                .collect(),

            Phasors::OnTheFly {
                uvs,
                pixel_coords,
                pulse,
                pixel_size,
            } => pixel_coords
                .par_iter()
                .map(|&(x, y)| {
                    uvs.iter()
                        .zip(vis_grad.iter())
                        .map(|(&(u, v), g)| {
                            let a = phasor_at(u, v, x, y, *pulse, *pixel_size);
                            a.re * g.re + a.im * g.im
                        })
                        .sum()
                })
                .collect(),
        };
        let mut out = Array2::zeros((self.ny, self.nx));
        out.iter_mut().zip(grad).for_each(|(out, g)| *out = g);
        out
    }

    /// Predict the visibilities of one Stokes component of `image`.
    pub fn predict_stokes(
        &self,
        image: &Image,
        stokes: Stokes,
    ) -> Result<Array1<c64>, ImagerError> {
        self.check_image(image)?;
        let plane = image.require(stokes, "Visibility prediction")?;
        Ok(self.forward(plane))
    }

    /// Predict the linear polarisation visibilities Q + iU.
    pub fn predict_linear_pol(&self, image: &Image) -> Result<Array1<c64>, ImagerError> {
        let q = self.predict_stokes(image, Stokes::Q)?;
        let u = self.predict_stokes(image, Stokes::U)?;
        Ok(q + u.mapv(|u| c64::i() * u))
    }

    fn check_image(&self, image: &Image) -> Result<(), ImagerError> {
        let (n_pol, ny, nx) = image.dim();
        if (ny, nx) != (self.ny, self.nx) {
            return Err(ImagerError::ShapeMismatch {
                context: "visibility prediction".to_string(),
                expected: (n_pol, self.ny, self.nx),
                got: image.dim(),
            });
        }
        Ok(())
    }
}

#[inline]
fn phasor_at(u: f64, v: f64, x: f64, y: f64, pulse: Pulse, pixel_size: f64) -> c64 {
    c64::from_polar(
        pulse.response(u, v, pixel_size),
        -2.0 * PI * (u * x + v * y),
    )
}
