// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Data terms on polarimetric visibilities, normalised by Stokes I.
//!
//! Ratios rather than raw polarised visibilities are fitted, as they are
//! insensitive to many calibration errors shared between the components.

use super::{closure::report_dropped, DataTermKind, Predictions, VisGradient, VisibilityLoss};
use crate::{c64, image::Stokes, observation::FilteredObservation, ImagerError, ImagerWarning};

/// chi^2 = 1/(2N) sum |m - m_obs|^2 / sigma_m^2, where m is either the
/// fractional linear polarisation (Q + iU) / I or the fractional circular
/// polarisation V / I of each visibility.
pub struct PolRatioTerm {
    kind: DataTermKind,

    /// The visibility each ratio comes from.
    indices: Vec<usize>,
    data: Vec<c64>,
    sigma: Vec<f64>,
}

impl PolRatioTerm {
    /// `kind` must be [`DataTermKind::PolFraction`] or
    /// [`DataTermKind::CircularPol`].
    pub fn new(
        obs: &FilteredObservation,
        kind: DataTermKind,
        warnings: &mut Vec<ImagerWarning>,
    ) -> Result<PolRatioTerm, ImagerError> {
        assert!(
            matches!(kind, DataTermKind::PolFraction | DataTermKind::CircularPol),
            "{kind} is not a polarimetric ratio"
        );

        let mut no_pol = 0;
        let mut degenerate = 0;
        let mut indices = vec![];
        let mut data = vec![];
        let mut sigma = vec![];
        for (i, vis) in obs.visibilities.iter().enumerate() {
            let Some(pol) = &vis.pol else {
                no_pol += 1;
                continue;
            };
            let i_amp = vis.vis.norm();
            if i_amp <= 0.0 {
                degenerate += 1;
                continue;
            }

            let (numerator, numerator_sigma) = match kind {
                DataTermKind::PolFraction => (
                    pol.q + c64::i() * pol.u,
                    pol.sigma_q.hypot(pol.sigma_u),
                ),
                _ => (pol.v, pol.sigma_v),
            };
            let ratio = numerator / vis.vis;
            indices.push(i);
            data.push(ratio);
            // First-order propagation of the numerator and Stokes I noise.
            sigma.push(numerator_sigma.hypot(ratio.norm() * vis.sigma) / i_amp);
        }

        if no_pol > 0 {
            ImagerWarning::NoPolarimetry {
                count: no_pol,
                term: kind.to_string(),
            }
            .emit(warnings);
        }
        report_dropped(kind, degenerate, data.len(), warnings)?;
        Ok(PolRatioTerm {
            kind,
            indices,
            data,
            sigma,
        })
    }

    pub fn kind(&self) -> DataTermKind {
        self.kind
    }
}

impl VisibilityLoss for PolRatioTerm {
    fn accumulate(
        &self,
        predictions: &Predictions,
        weight: f64,
        grad: &mut VisGradient,
    ) -> Result<f64, ImagerError> {
        let model_i = predictions.get(Stokes::I, self.kind)?;
        let numerator: Vec<c64> = match self.kind {
            DataTermKind::PolFraction => {
                let q = predictions.get(Stokes::Q, self.kind)?;
                let u = predictions.get(Stokes::U, self.kind)?;
                self.indices
                    .iter()
                    .map(|&i| q[i] + c64::i() * u[i])
                    .collect()
            }
            _ => {
                let v = predictions.get(Stokes::V, self.kind)?;
                self.indices.iter().map(|&i| v[i]).collect()
            }
        };
        let n = self.data.len() as f64;

        let mut chi2 = 0.0;
        let mut g_numerator = Vec::with_capacity(self.indices.len());
        let mut g_i = Vec::with_capacity(self.indices.len());
        for (((&index, &num), &datum), &sigma) in self
            .indices
            .iter()
            .zip(numerator.iter())
            .zip(self.data.iter())
            .zip(self.sigma.iter())
        {
            let i = model_i[index];
            let inv_var = sigma.powi(-2);
            if i.norm_sqr() > 0.0 {
                let ratio = num / i;
                let residual = ratio - datum;
                chi2 += residual.norm_sqr() * inv_var;
                let g_ratio = residual * (weight * inv_var / n);
                // m = P / I: dm/dP = 1 / I, dm/dI = -P / I^2.
                g_numerator.push(g_ratio * i.inv().conj());
                g_i.push(-g_ratio * (ratio / i).conj());
            } else {
                // Without Stokes I the ratio is undefined; count the whole
                // datum as residual and leave the gradient flat.
                chi2 += datum.norm_sqr() * inv_var;
                g_numerator.push(c64::new(0.0, 0.0));
                g_i.push(c64::new(0.0, 0.0));
            }
        }

        {
            let grad_i = grad.plane_mut(Stokes::I);
            for (&index, g) in self.indices.iter().zip(g_i) {
                grad_i[index] += g;
            }
        }
        match self.kind {
            DataTermKind::PolFraction => {
                {
                    let grad_q = grad.plane_mut(Stokes::Q);
                    for (&index, &g) in self.indices.iter().zip(g_numerator.iter()) {
                        grad_q[index] += g;
                    }
                }
                // P = Q + iU, so dL/dU = conj(i) dL/dP.
                let grad_u = grad.plane_mut(Stokes::U);
                for (&index, &g) in self.indices.iter().zip(g_numerator.iter()) {
                    grad_u[index] += -c64::i() * g;
                }
            }
            _ => {
                let grad_v = grad.plane_mut(Stokes::V);
                for (&index, g) in self.indices.iter().zip(g_numerator) {
                    grad_v[index] += g;
                }
            }
        }
        Ok(chi2 / (2.0 * n))
    }

    fn num_data(&self) -> usize {
        self.data.len()
    }
}
