// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The weighted sum of data terms and regularisers that is minimised.
//!
//! [`ObjectiveAssembler`] works on images. The optimiser works on flat
//! parameter vectors through the [`Objective`] trait; [`ImageObjective`]
//! translates between the two.

mod parameters;

pub use parameters::{ImageObjective, Transform};

use itertools::Itertools;
use log::trace;
use ndarray::prelude::*;

use crate::{
    data_terms::{DataTerm, DataTermKind, Predictions, VisGradient},
    image::{Image, Stokes},
    model::ForwardModel,
    regularisers::{Regulariser, RegulariserKind},
    ImagerError,
};

/// Something the optimiser can minimise.
pub trait Objective {
    /// The length of parameter vectors.
    fn num_params(&self) -> usize;

    /// The value of the objective at `x`, and its gradient with respect to
    /// `x`.
    fn value_and_gradient(&self, x: ArrayView1<f64>) -> Result<(f64, Array1<f64>), ImagerError>;

    /// An approximation of the inverse Hessian's diagonal at `x`. Search
    /// directions are scaled by this if it is available.
    fn preconditioner(&self, _x: ArrayView1<f64>) -> Option<Array1<f64>> {
        None
    }
}

/// Everything known about the objective at one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveEvaluation {
    /// The weighted sum of all terms.
    pub total: f64,

    /// The gradient of `total` with respect to every pixel of every Stokes
    /// plane.
    pub gradient: Array3<f64>,

    /// The unweighted chi-squared of each data term, in the order the terms
    /// were given.
    pub data_terms: Vec<(DataTermKind, f64)>,

    /// The unweighted value of each regulariser, in the order they were
    /// given.
    pub regularisers: Vec<(RegulariserKind, f64)>,

    /// The number of pixel values the regularisers clamped to a floor.
    pub clamped: usize,
}

/// Weighted data terms and regularisers sharing one forward model.
pub struct ObjectiveAssembler<'a> {
    model: &'a ForwardModel,
    data_terms: Vec<(&'a DataTerm, f64)>,
    regularisers: Vec<(Regulariser, f64)>,

    /// Every Stokes plane any data term needs predicted.
    stokes: Vec<Stokes>,
}

impl<'a> ObjectiveAssembler<'a> {
    /// Data terms are shared between stages, so they are borrowed. Weights
    /// must be finite and non-negative.
    pub fn new(
        model: &'a ForwardModel,
        data_terms: Vec<(&'a DataTerm, f64)>,
        regularisers: Vec<(Regulariser, f64)>,
    ) -> Result<ObjectiveAssembler<'a>, ImagerError> {
        let bad_weight = |w: f64| !(w.is_finite() && w >= 0.0);
        if let Some((term, w)) = data_terms.iter().find(|(_, w)| bad_weight(*w)) {
            return Err(ImagerError::InvalidConfig(format!(
                "The {} data term has an invalid weight ({w})",
                term.kind()
            )));
        }
        if let Some((reg, w)) = regularisers.iter().find(|(_, w)| bad_weight(*w)) {
            return Err(ImagerError::InvalidConfig(format!(
                "The {} regulariser has an invalid weight ({w})",
                reg.kind()
            )));
        }

        let stokes = data_terms
            .iter()
            .flat_map(|(term, _)| term.kind().stokes().iter().copied())
            .unique()
            .collect();
        Ok(ObjectiveAssembler {
            model,
            data_terms,
            regularisers,
            stokes,
        })
    }

    pub fn model(&self) -> &ForwardModel {
        self.model
    }

    pub fn data_terms(&self) -> impl Iterator<Item = (&DataTerm, f64)> {
        self.data_terms.iter().map(|(term, w)| (*term, *w))
    }

    pub fn regularisers(&self) -> impl Iterator<Item = (&Regulariser, f64)> {
        self.regularisers.iter().map(|(reg, w)| (reg, *w))
    }

    /// Whether any data term or regulariser depends on a polarimetric plane.
    pub fn constrains_polarisation(&self) -> bool {
        self.stokes
            .iter()
            .chain(
                self.regularisers
                    .iter()
                    .flat_map(|(reg, _)| reg.kind().stokes()),
            )
            .any(|&s| s != Stokes::I)
    }

    pub fn evaluate(&self, image: &Image) -> Result<ObjectiveEvaluation, ImagerError> {
        let predictions = Predictions::new(image, self.model, &self.stokes)?;
        let mut vis_grad = VisGradient::new(self.model.num_vis());

        let mut total = 0.0;
        let mut data_terms = Vec::with_capacity(self.data_terms.len());
        for (term, weight) in &self.data_terms {
            let chi_sq = term.accumulate(&predictions, *weight, &mut vis_grad)?;
            total += weight * chi_sq;
            data_terms.push((term.kind(), chi_sq));
        }
        let mut gradient = vis_grad.to_image_gradient(image, self.model);
        check_shape("the data-term gradient", image, &gradient)?;

        let mut regularisers = Vec::with_capacity(self.regularisers.len());
        let mut clamped = 0;
        for (reg, weight) in &self.regularisers {
            let eval = reg.evaluate(image)?;
            check_shape(&format!("the {} gradient", reg.kind()), image, &eval.gradient)?;
            total += weight * eval.value;
            gradient.scaled_add(*weight, &eval.gradient);
            regularisers.push((reg.kind(), eval.value));
            clamped += eval.clamped;
        }

        trace!("objective: {total:e}");
        Ok(ObjectiveEvaluation {
            total,
            gradient,
            data_terms,
            regularisers,
            clamped,
        })
    }

    /// The unweighted chi-squared of every data term, without any gradients.
    pub fn chi_squared(&self, image: &Image) -> Result<Vec<(DataTermKind, f64)>, ImagerError> {
        let predictions = Predictions::new(image, self.model, &self.stokes)?;
        let mut scratch = VisGradient::new(self.model.num_vis());
        self.data_terms
            .iter()
            .map(|(term, _)| -> Result<_, ImagerError> {
                let chi_sq = term.accumulate(&predictions, 0.0, &mut scratch)?;
                Ok((term.kind(), chi_sq))
            })
            .collect()
    }
}

fn check_shape(context: &str, image: &Image, gradient: &Array3<f64>) -> Result<(), ImagerError> {
    if gradient.dim() == image.dim() {
        Ok(())
    } else {
        Err(ImagerError::ShapeMismatch {
            context: context.to_string(),
            expected: image.dim(),
            got: gradient.dim(),
        })
    }
}
