// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Images as flat parameter vectors.
//!
//! Only the pixels of the embedding mask are free; the others stay at zero.
//! Parameters are ordered by Stokes plane, then by masked pixel in row-major
//! order.

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use super::{Objective, ObjectiveAssembler};
use crate::{constants::DEFAULT_ENTROPY_FLOOR, image::Image, ImagerError};

/// How Stokes I pixels map to optimiser parameters. Polarimetric planes are
/// always linear.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Transform {
    /// Parameters are pixel values.
    Linear,

    /// Parameters are the logs of pixel values, which keeps Stokes I
    /// positive.
    #[default]
    Log,
}

pub struct ImageObjective<'a> {
    assembler: &'a ObjectiveAssembler<'a>,

    /// Supplies the geometry and Stokes planes of every image made.
    template: Image,

    /// The (iy, ix) of every free pixel.
    active: Vec<(usize, usize)>,

    transform: Transform,
}

impl<'a> ImageObjective<'a> {
    /// Only pixels where Stokes I of `prior` exceeds `clip_floor` are free. If
    /// there is no clip floor, every pixel is.
    pub fn new(
        assembler: &'a ObjectiveAssembler<'a>,
        prior: &Image,
        clip_floor: Option<f64>,
        transform: Transform,
    ) -> ImageObjective<'a> {
        let active = prior
            .stokes_i()
            .indexed_iter()
            .filter(|&(_, &i)| clip_floor.map_or(true, |floor| i > floor))
            .map(|(pixel, _)| pixel)
            .collect();
        ImageObjective {
            assembler,
            template: prior.with_data(Array3::zeros(prior.dim())),
            active,
            transform,
        }
    }

    pub fn num_active_pixels(&self) -> usize {
        self.active.len()
    }

    /// The parameters of `image`. Pixels outside the mask are ignored. Under
    /// the log transform, Stokes I is clamped to a small positive floor.
    pub fn to_params(&self, image: &Image) -> Result<Array1<f64>, ImagerError> {
        if image.dim() != self.template.dim() || image.pols() != self.template.pols() {
            return Err(ImagerError::ShapeMismatch {
                context: "the initial image".to_string(),
                expected: self.template.dim(),
                got: image.dim(),
            });
        }

        let mut params = Array1::zeros(self.num_params());
        let n = self.active.len();
        for (p, plane) in image.data().outer_iter().enumerate() {
            let log = p == 0 && self.transform == Transform::Log;
            for (param, pixel) in params
                .slice_mut(s![p * n..(p + 1) * n])
                .iter_mut()
                .zip(self.active.iter())
            {
                let value = plane[*pixel];
                *param = if log {
                    value.max(DEFAULT_ENTROPY_FLOOR).ln()
                } else {
                    value
                };
            }
        }
        Ok(params)
    }

    pub fn to_image(&self, params: ArrayView1<f64>) -> Image {
        assert_eq!(params.len(), self.num_params());
        let mut data = Array3::zeros(self.template.dim());
        let n = self.active.len();
        for (p, mut plane) in data.outer_iter_mut().enumerate() {
            let log = p == 0 && self.transform == Transform::Log;
            for (&param, pixel) in params
                .slice(s![p * n..(p + 1) * n])
                .iter()
                .zip(self.active.iter())
            {
                plane[*pixel] = if log { param.exp() } else { param };
            }
        }
        self.template.with_data(data)
    }
}

impl Objective for ImageObjective<'_> {
    fn num_params(&self) -> usize {
        self.template.pols().len() * self.active.len()
    }

    fn value_and_gradient(&self, x: ArrayView1<f64>) -> Result<(f64, Array1<f64>), ImagerError> {
        let image = self.to_image(x);
        let eval = self.assembler.evaluate(&image)?;

        let mut grad = Array1::zeros(self.num_params());
        let n = self.active.len();
        for (p, (plane_grad, plane)) in eval
            .gradient
            .outer_iter()
            .zip(image.data().outer_iter())
            .enumerate()
        {
            let log = p == 0 && self.transform == Transform::Log;
            for (g, pixel) in grad
                .slice_mut(s![p * n..(p + 1) * n])
                .iter_mut()
                .zip(self.active.iter())
            {
                // d/d(ln I) = I d/dI
                *g = if log {
                    plane_grad[*pixel] * plane[*pixel]
                } else {
                    plane_grad[*pixel]
                };
            }
        }
        Ok((eval.total, grad))
    }
}
