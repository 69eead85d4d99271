// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Data terms on individual Stokes I visibilities.

use super::{AmpDebias, DataTermKind, Predictions, VisGradient, VisibilityLoss};
use crate::{c64, image::Stokes, observation::FilteredObservation, ImagerError};

/// chi^2 = 1/(2N) sum |V - D|^2 / sigma^2
pub struct VisTerm {
    data: Vec<c64>,
    sigma: Vec<f64>,
}

impl VisTerm {
    pub fn new(obs: &FilteredObservation) -> VisTerm {
        VisTerm {
            data: obs.visibilities.iter().map(|v| v.vis).collect(),
            sigma: obs.visibilities.iter().map(|v| v.sigma).collect(),
        }
    }
}

impl VisibilityLoss for VisTerm {
    fn accumulate(
        &self,
        predictions: &Predictions,
        weight: f64,
        grad: &mut VisGradient,
    ) -> Result<f64, ImagerError> {
        let model = predictions.get(Stokes::I, DataTermKind::Vis)?;
        let n = self.data.len() as f64;
        let grad = grad.plane_mut(Stokes::I);

        let mut chi2 = 0.0;
        for (((g, &v), &d), &sigma) in grad
            .iter_mut()
            .zip(model.iter())
            .zip(self.data.iter())
            .zip(self.sigma.iter())
        {
            let residual = v - d;
            let inv_var = sigma.powi(-2);
            chi2 += residual.norm_sqr() * inv_var;
            *g += residual * (weight * inv_var / n);
        }
        Ok(chi2 / (2.0 * n))
    }

    fn num_data(&self) -> usize {
        self.data.len()
    }
}

/// chi^2 = 1/N sum (|V| - A)^2 / sigma^2, where A are debiased measured
/// amplitudes.
pub struct AmpTerm {
    amps: Vec<f64>,
    sigma: Vec<f64>,
}

impl AmpTerm {
    pub fn new(obs: &FilteredObservation, debias: AmpDebias) -> AmpTerm {
        AmpTerm {
            amps: obs
                .visibilities
                .iter()
                .map(|v| debias.debias(v.vis.norm(), v.sigma))
                .collect(),
            sigma: obs.visibilities.iter().map(|v| v.sigma).collect(),
        }
    }
}

impl VisibilityLoss for AmpTerm {
    fn accumulate(
        &self,
        predictions: &Predictions,
        weight: f64,
        grad: &mut VisGradient,
    ) -> Result<f64, ImagerError> {
        let model = predictions.get(Stokes::I, DataTermKind::Amp)?;
        let n = self.amps.len() as f64;
        let grad = grad.plane_mut(Stokes::I);

        let mut chi2 = 0.0;
        for (((g, &v), &amp), &sigma) in grad
            .iter_mut()
            .zip(model.iter())
            .zip(self.amps.iter())
            .zip(self.sigma.iter())
        {
            let model_amp = v.norm();
            let residual = model_amp - amp;
            let inv_var = sigma.powi(-2);
            chi2 += residual * residual * inv_var;
            // d|V| is undefined at the origin; leave it flat there.
            if model_amp > 0.0 {
                *g += v * (weight * 2.0 * residual * inv_var / (n * model_amp));
            }
        }
        Ok(chi2 / n)
    }

    fn num_data(&self) -> usize {
        self.amps.len()
    }
}
