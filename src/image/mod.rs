// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Images of (possibly polarised) sky brightness.
//!
//! An [`Image`] is a stack of equally-shaped 2D pixel grids, one per Stokes
//! component. The array is ordered `[stokes][y][x]`; all components share the
//! same [`ImageGeometry`] by construction.


use std::f64::consts::LN_2;

use ndarray::{prelude::*, Zip};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use vec1::Vec1;

use crate::ImagerError;

/// A polarimetric component of an image.
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
pub enum Stokes {
    I,
    Q,
    U,
    V,
}

/// A sky position \[radians\].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RADec {
    pub ra: f64,
    pub dec: f64,
}

impl RADec {
    pub fn from_degrees(ra: f64, dec: f64) -> RADec {
        RADec {
            ra: ra.to_radians(),
            dec: dec.to_radians(),
        }
    }
}

/// Everything about an image except its pixel values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageGeometry {
    /// The number of pixels along the x (RA) axis.
    pub nx: usize,

    /// The number of pixels along the y (Dec) axis.
    pub ny: usize,

    /// The angular size of a pixel \[radians\].
    pub pixel_size: f64,

    /// The sky position of the image centre.
    pub phase_centre: RADec,

    /// The reference frequency of the source \[Hz\].
    pub freq_hz: f64,

    pub source: String,

    /// The modified Julian date the image refers to.
    pub mjd: f64,
}

impl ImageGeometry {
    pub fn num_pixels(&self) -> usize {
        self.nx * self.ny
    }

    /// The angular extent of the longer image side \[radians\].
    pub fn field_of_view(&self) -> f64 {
        self.nx.max(self.ny) as f64 * self.pixel_size
    }

    /// The sky offsets (x, y) of every pixel from the image centre
    /// \[radians\], in row-major (y, then x) order. RA increases to the left,
    /// so x decreases with the column index.
    pub fn pixel_coords(&self) -> Vec<(f64, f64)> {
        let half_x = (self.nx / 2) as isize;
        let half_y = (self.ny / 2) as isize;
        (0..self.ny as isize)
            .flat_map(|iy| {
                (0..self.nx as isize).map(move |ix| {
                    (
                        (half_x - ix) as f64 * self.pixel_size,
                        (half_y - iy) as f64 * self.pixel_size,
                    )
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    geometry: ImageGeometry,

    /// The Stokes component of each plane of `data`. Stokes I is always
    /// first.
    pols: Vec1<Stokes>,

    /// Pixel values \[Jy/pixel\]. The first dimension is Stokes component, the
    /// second is y, the third is x.
    data: Array3<f64>,
}

impl Image {
    /// Make a total-intensity image.
    pub fn new(geometry: ImageGeometry, stokes_i: Array2<f64>) -> Result<Image, ImagerError> {
        let (ny, nx) = stokes_i.dim();
        let data = stokes_i.into_shape_with_order((1, ny, nx)).map_err(|_| {
            ImagerError::InvalidConfig("Stokes I pixels could not be reshaped".to_string())
        })?;
        Image::from_stokes(geometry, Vec1::new(Stokes::I), data)
    }

    /// Make an image from a stack of Stokes planes. Stokes I must be the first
    /// plane and no component may be repeated. The pixel size must be
    /// positive and finite.
    pub fn from_stokes(
        geometry: ImageGeometry,
        pols: Vec1<Stokes>,
        data: Array3<f64>,
    ) -> Result<Image, ImagerError> {
        if !(geometry.pixel_size.is_finite() && geometry.pixel_size > 0.0) {
            return Err(ImagerError::InvalidConfig(format!(
                "The pixel size must be positive and finite, got {}",
                geometry.pixel_size
            )));
        }
        let expected = (pols.len(), geometry.ny, geometry.nx);
        if data.dim() != expected {
            return Err(ImagerError::ShapeMismatch {
                context: "image construction".to_string(),
                expected,
                got: data.dim(),
            });
        }
        if *pols.first() != Stokes::I {
            return Err(ImagerError::MissingPolarisation {
                stokes: Stokes::I,
                needed_by: "An image".to_string(),
            });
        }
        for (i, pol) in pols.iter().enumerate() {
            if pols[..i].contains(pol) {
                return Err(ImagerError::InvalidConfig(format!(
                    "Stokes {pol} appears more than once in an image"
                )));
            }
        }

        Ok(Image {
            geometry,
            pols,
            data,
        })
    }

    /// Add (or replace) a polarimetric plane.
    pub fn add_polarisation(
        &mut self,
        stokes: Stokes,
        plane: Array2<f64>,
    ) -> Result<(), ImagerError> {
        let expected = (self.geometry.ny, self.geometry.nx);
        if plane.dim() != expected {
            return Err(ImagerError::ShapeMismatch {
                context: format!("adding Stokes {stokes}"),
                expected: (1, expected.0, expected.1),
                got: (1, plane.dim().0, plane.dim().1),
            });
        }

        match self.stokes_index(stokes) {
            Some(i) => self.data.index_axis_mut(Axis(0), i).assign(&plane),
            None => {
                let mut data = Array3::zeros((self.pols.len() + 1, expected.0, expected.1));
                data.slice_mut(s![..self.pols.len(), .., ..])
                    .assign(&self.data);
                data.index_axis_mut(Axis(0), self.pols.len()).assign(&plane);
                self.data = data;
                self.pols.push(stokes);
            }
        }
        Ok(())
    }

    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    pub fn pols(&self) -> &[Stokes] {
        &self.pols
    }

    pub fn data(&self) -> ArrayView3<f64> {
        self.data.view()
    }

    pub(crate) fn data_mut(&mut self) -> ArrayViewMut3<f64> {
        self.data.view_mut()
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn stokes_index(&self, stokes: Stokes) -> Option<usize> {
        self.pols.iter().position(|&p| p == stokes)
    }

    pub fn stokes(&self, stokes: Stokes) -> Option<ArrayView2<f64>> {
        self.stokes_index(stokes)
            .map(|i| self.data.index_axis(Axis(0), i))
    }

    /// Get a Stokes plane that some part of the imager can't work without.
    pub(crate) fn require(
        &self,
        stokes: Stokes,
        needed_by: &str,
    ) -> Result<ArrayView2<f64>, ImagerError> {
        self.stokes(stokes)
            .ok_or_else(|| ImagerError::MissingPolarisation {
                stokes,
                needed_by: needed_by.to_string(),
            })
    }

    pub fn stokes_i(&self) -> ArrayView2<f64> {
        self.data.index_axis(Axis(0), 0)
    }

    /// The sum of Stokes I \[Jy\].
    pub fn total_flux(&self) -> f64 {
        self.stokes_i().sum()
    }

    /// The Stokes I flux-weighted centre of the image \[radians\]. `None` if
    /// there is no flux.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        let flux = self.total_flux();
        if flux.abs() < f64::MIN_POSITIVE {
            return None;
        }
        let (sx, sy) = self
            .geometry
            .pixel_coords()
            .into_iter()
            .zip(self.stokes_i().iter())
            .fold((0.0, 0.0), |(sx, sy), ((x, y), &i)| (sx + i * x, sy + i * y));
        Some((sx / flux, sy / flux))
    }

    /// A copy of this image with the same geometry and polarisations but new
    /// pixel values.
    pub(crate) fn with_data(&self, data: Array3<f64>) -> Image {
        assert_eq!(data.dim(), self.data.dim());
        Image {
            geometry: self.geometry.clone(),
            pols: self.pols.clone(),
            data,
        }
    }

    /// Rescale all planes so that Stokes I sums to `flux`. Polarimetric planes
    /// are scaled by the same factor so fractional polarisation is kept. An
    /// image without flux is returned unchanged.
    pub fn with_total_flux(&self, flux: f64) -> Image {
        let current = self.total_flux();
        if current.abs() < f64::MIN_POSITIVE {
            return self.clone();
        }
        self.with_data(&self.data * (flux / current))
    }

    /// Set the polarimetric planes so every pixel has the fractional
    /// polarisation it has in `reference`, relative to this image's Stokes I.
    /// Pixels where `reference` has no positive Stokes I keep their values.
    pub(crate) fn keep_polarisation_fraction(&mut self, reference: &Image) {
        assert_eq!(self.dim(), reference.dim());
        let (stokes_i, mut pol) = self.data.view_mut().split_at(Axis(0), 1);
        let stokes_i = stokes_i.index_axis(Axis(0), 0);
        let ref_data = reference.data();
        let ref_i = ref_data.index_axis(Axis(0), 0);
        for (plane, ref_plane) in pol
            .outer_iter_mut()
            .zip(ref_data.slice(s![1.., .., ..]).outer_iter())
        {
            Zip::from(plane)
                .and(ref_plane)
                .and(stokes_i)
                .and(ref_i)
                .for_each(|p, &ref_p, &i, &ref_i| {
                    if ref_i > 0.0 {
                        *p = ref_p * i / ref_i;
                    }
                });
        }
    }

    /// Convolve every plane with a circular Gaussian. `fwhm` is in radians.
    /// Edges are zero-padded, so flux near the edge leaks out of the image.
    pub fn blur(&self, fwhm: f64) -> Image {
        if fwhm <= 0.0 {
            return self.clone();
        }
        let sigma_px = fwhm / (2.0 * (2.0 * LN_2).sqrt()) / self.geometry.pixel_size;
        let radius = (4.0 * sigma_px).ceil() as isize;
        let kernel: Vec<f64> = {
            let k: Vec<f64> = (-radius..=radius)
                .map(|i| (-0.5 * (i as f64 / sigma_px).powi(2)).exp())
                .collect();
            let norm: f64 = k.iter().sum();
            k.into_iter().map(|v| v / norm).collect()
        };

        let mut out = Array3::zeros(self.data.raw_dim());
        for (plane, mut out_plane) in self.data.outer_iter().zip(out.outer_iter_mut()) {
            let rows = convolve_axis(plane, &kernel, Axis(1));
            out_plane.assign(&convolve_axis(rows.view(), &kernel, Axis(0)));
        }
        self.with_data(out)
    }
}

/// 1D convolution of every lane of `plane` along `axis`. `kernel` has an odd
/// length and is centred.
fn convolve_axis(plane: ArrayView2<f64>, kernel: &[f64], axis: Axis) -> Array2<f64> {
    let radius = (kernel.len() / 2) as isize;
    let mut out = Array2::zeros(plane.raw_dim());
    for (lane, mut out_lane) in plane.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let n = lane.len() as isize;
        for (i, out) in out_lane.iter_mut().enumerate() {
            let i = i as isize;
            *out = kernel
                .iter()
                .enumerate()
                .filter_map(|(k, w)| {
                    let j = i + k as isize - radius;
                    (0..n).contains(&j).then(|| w * lane[j as usize])
                })
                .sum();
        }
    }
    out
}
