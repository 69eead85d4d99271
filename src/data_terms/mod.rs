// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Measures of how well an image explains the data.
//!
//! Every data term is a normalised chi-squared: a value near 1 means the image
//! fits the data to within the noise. Data terms don't talk to images
//! directly; they are handed the predicted visibilities of the Stokes planes
//! they need ([`Predictions`]) and accumulate their gradient with respect to
//! those visibilities ([`VisGradient`]). Only one adjoint transform per Stokes
//! plane is then needed, however many terms are active.
//!
//! Complex gradients use the convention g = dL/dRe(V) + i dL/dIm(V).

mod closure;
mod polarimetric;
#[cfg(test)]
pub(crate) mod tests;
mod visibility;

pub use closure::{BispectrumTerm, ClosureAmpTerm, ClosurePhaseTerm};
pub use polarimetric::PolRatioTerm;
pub use visibility::{AmpTerm, VisTerm};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    c64,
    image::{Image, Stokes},
    model::ForwardModel,
    observation::{ClosureSet, FilteredObservation},
    ImagerError, ImagerWarning,
};

/// The kinds of data term. Names match those used in imaging plans.
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
pub enum DataTermKind {
    /// Complex visibilities.
    Vis,

    /// Visibility amplitudes.
    Amp,

    /// Complex bispectra (triple products) around closed triangles.
    Bispectrum,

    /// Closure phases around closed triangles.
    ClosurePhase,

    /// Closure amplitudes on quadrangles.
    ClosureAmp,

    /// Log closure amplitudes on quadrangles.
    LogClosureAmp,

    /// The complex fractional linear polarisation (Q + iU) / I.
    PolFraction,

    /// The fractional circular polarisation V / I.
    CircularPol,
}

impl DataTermKind {
    /// Does this term need closed loops of baselines?
    pub fn uses_closures(self) -> bool {
        matches!(
            self,
            DataTermKind::Bispectrum
                | DataTermKind::ClosurePhase
                | DataTermKind::ClosureAmp
                | DataTermKind::LogClosureAmp
        )
    }

    /// The Stokes planes this term is sensitive to.
    pub fn stokes(self) -> &'static [Stokes] {
        match self {
            DataTermKind::PolFraction => &[Stokes::I, Stokes::Q, Stokes::U],
            DataTermKind::CircularPol => &[Stokes::I, Stokes::V],
            _ => &[Stokes::I],
        }
    }
}

/// How measured amplitudes are corrected for the positive bias noise gives
/// them at low signal-to-noise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmpDebias {
    /// Use the measured amplitudes.
    None,

    /// A = sqrt(|V|^2 - sigma^2). Amplitudes smaller than their noise are left
    /// as measured.
    #[default]
    Quadrature,

    /// A = sqrt(max(|V|^2 - sigma^2, 0)). Amplitudes smaller than their noise
    /// become zero.
    QuadratureFloor,
}

impl AmpDebias {
    pub fn debias(self, amp: f64, sigma: f64) -> f64 {
        let debiased_sq = amp * amp - sigma * sigma;
        match self {
            AmpDebias::None => amp,
            AmpDebias::Quadrature if debiased_sq < 0.0 => amp,
            AmpDebias::Quadrature => debiased_sq.sqrt(),
            AmpDebias::QuadratureFloor => debiased_sq.max(0.0).sqrt(),
        }
    }
}

/// Settings used when turning measurements into data terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataTermSettings {
    pub amp_debias: AmpDebias,

    /// Closure amplitudes with a signal-to-noise ratio below this are not
    /// used.
    pub closure_snr_cut: f64,
}

impl Default for DataTermSettings {
    fn default() -> Self {
        DataTermSettings {
            amp_debias: AmpDebias::default(),
            closure_snr_cut: 0.0,
        }
    }
}

/// The value of one term, and its gradient with respect to every pixel of
/// every Stokes plane of the image it was evaluated on.
#[derive(Debug, Clone, PartialEq)]
pub struct TermEvaluation {
    pub value: f64,
    pub gradient: Array3<f64>,
}

/// Predicted visibilities of some of the Stokes planes of an image.
pub struct Predictions {
    planes: [Option<Array1<c64>>; 4],
}

impl Predictions {
    /// Predict the planes in `stokes` that `image` has. Planes the image
    /// doesn't have are left out; asking for them later is an error.
    pub fn new(
        image: &Image,
        model: &ForwardModel,
        stokes: &[Stokes],
    ) -> Result<Predictions, ImagerError> {
        let mut planes = [None, None, None, None];
        for &s in stokes {
            if planes[s as usize].is_none() && image.stokes(s).is_some() {
                planes[s as usize] = Some(model.predict_stokes(image, s)?);
            }
        }
        Ok(Predictions { planes })
    }

    pub fn get(
        &self,
        stokes: Stokes,
        needed_by: DataTermKind,
    ) -> Result<&Array1<c64>, ImagerError> {
        self.planes[stokes as usize]
            .as_ref()
            .ok_or_else(|| ImagerError::MissingPolarisation {
                stokes,
                needed_by: format!("The {needed_by} data term"),
            })
    }
}

/// The gradient of a weighted sum of data terms with respect to predicted
/// visibilities, per Stokes plane.
pub struct VisGradient {
    num_vis: usize,
    planes: [Option<Array1<c64>>; 4],
}

impl VisGradient {
    pub fn new(num_vis: usize) -> VisGradient {
        VisGradient {
            num_vis,
            planes: [None, None, None, None],
        }
    }

    pub(crate) fn plane_mut(&mut self, stokes: Stokes) -> &mut Array1<c64> {
        let num_vis = self.num_vis;
        self.planes[stokes as usize].get_or_insert_with(|| Array1::zeros(num_vis))
    }

    /// Map the visibility gradient back to the image. Planes without a
    /// gradient get zeros.
    pub fn to_image_gradient(&self, image: &Image, model: &ForwardModel) -> Array3<f64> {
        let mut gradient = Array3::zeros(image.dim());
        for (pol, mut out) in image.pols().iter().zip(gradient.outer_iter_mut()) {
            if let Some(vis_grad) = &self.planes[*pol as usize] {
                out.assign(&model.adjoint(vis_grad.view()));
            }
        }
        gradient
    }
}

/// The part every data term shares: a chi-squared of predicted visibilities.
trait VisibilityLoss {
    /// Get the chi-squared of `predictions`, and add `weight` times its
    /// gradient to `grad`.
    fn accumulate(
        &self,
        predictions: &Predictions,
        weight: f64,
        grad: &mut VisGradient,
    ) -> Result<f64, ImagerError>;

    fn num_data(&self) -> usize;
}

pub enum DataTerm {
    Vis(VisTerm),
    Amp(AmpTerm),
    Bispectrum(BispectrumTerm),
    ClosurePhase(ClosurePhaseTerm),
    ClosureAmp(ClosureAmpTerm),
    PolRatio(PolRatioTerm),
}

impl DataTerm {
    /// Set up a data term. Closure terms need `closures`; measurements that
    /// can't contribute are reported in `warnings`.
    pub fn new(
        kind: DataTermKind,
        obs: &FilteredObservation,
        closures: &ClosureSet,
        settings: DataTermSettings,
        warnings: &mut Vec<ImagerWarning>,
    ) -> Result<DataTerm, ImagerError> {
        let term = match kind {
            DataTermKind::Vis => DataTerm::Vis(VisTerm::new(obs)),
            DataTermKind::Amp => DataTerm::Amp(AmpTerm::new(obs, settings.amp_debias)),
            DataTermKind::Bispectrum => {
                DataTerm::Bispectrum(BispectrumTerm::new(obs, closures, warnings)?)
            }
            DataTermKind::ClosurePhase => {
                DataTerm::ClosurePhase(ClosurePhaseTerm::new(obs, closures, warnings)?)
            }
            DataTermKind::ClosureAmp | DataTermKind::LogClosureAmp => {
                DataTerm::ClosureAmp(ClosureAmpTerm::new(
                    obs,
                    closures,
                    kind == DataTermKind::LogClosureAmp,
                    settings,
                    warnings,
                )?)
            }
            DataTermKind::PolFraction | DataTermKind::CircularPol => {
                DataTerm::PolRatio(PolRatioTerm::new(obs, kind, warnings)?)
            }
        };
        Ok(term)
    }

    pub fn kind(&self) -> DataTermKind {
        match self {
            DataTerm::Vis(_) => DataTermKind::Vis,
            DataTerm::Amp(_) => DataTermKind::Amp,
            DataTerm::Bispectrum(_) => DataTermKind::Bispectrum,
            DataTerm::ClosurePhase(_) => DataTermKind::ClosurePhase,
            DataTerm::ClosureAmp(t) if t.is_log() => DataTermKind::LogClosureAmp,
            DataTerm::ClosureAmp(_) => DataTermKind::ClosureAmp,
            DataTerm::PolRatio(t) => t.kind(),
        }
    }

    /// The number of data points this term compares against.
    pub fn num_data(&self) -> usize {
        self.as_loss().num_data()
    }

    /// Get the chi-squared of `predictions` and add `weight` times its
    /// gradient with respect to the predicted visibilities to `grad`.
    pub fn accumulate(
        &self,
        predictions: &Predictions,
        weight: f64,
        grad: &mut VisGradient,
    ) -> Result<f64, ImagerError> {
        self.as_loss().accumulate(predictions, weight, grad)
    }

    /// Evaluate this term alone on an image.
    pub fn evaluate(
        &self,
        image: &Image,
        model: &ForwardModel,
    ) -> Result<TermEvaluation, ImagerError> {
        let predictions = Predictions::new(image, model, self.kind().stokes())?;
        let mut grad = VisGradient::new(model.num_vis());
        let value = self.accumulate(&predictions, 1.0, &mut grad)?;
        Ok(TermEvaluation {
            value,
            gradient: grad.to_image_gradient(image, model),
        })
    }

    fn as_loss(&self) -> &dyn VisibilityLoss {
        match self {
            DataTerm::Vis(t) => t,
            DataTerm::Amp(t) => t,
            DataTerm::Bispectrum(t) => t,
            DataTerm::ClosurePhase(t) => t,
            DataTerm::ClosureAmp(t) => t,
            DataTerm::PolRatio(t) => t,
        }
    }
}

/// The noise of a product or ratio of visibilities, relative to its
/// magnitude: sqrt(sum (sigma_i / |V_i|)^2). `None` if any amplitude is zero.
fn relative_noise(amps_and_sigmas: &[(f64, f64)]) -> Option<f64> {
    if amps_and_sigmas.iter().any(|&(amp, _)| amp <= 0.0) {
        return None;
    }
    Some(
        amps_and_sigmas
            .iter()
            .map(|&(amp, sigma)| (sigma / amp).powi(2))
            .sum::<f64>()
            .sqrt(),
    )
}
