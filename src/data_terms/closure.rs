// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Data terms on closed loops of baselines.
//!
//! Each term keeps its observed closure quantities and their noise, computed
//! once from the [`ClosureSet`]. Per-loop values and gradients are computed in
//! parallel, then summed in loop order.

use log::debug;
use ndarray::prelude::*;
use rayon::prelude::*;

use super::{
    relative_noise, DataTermKind, DataTermSettings, Predictions, VisGradient, VisibilityLoss,
};
use crate::{
    c64,
    image::Stokes,
    observation::{ClosureSet, FilteredObservation, Leg, Quadrangle, Triangle},
    ImagerError, ImagerWarning,
};

/// Model amplitudes are floored at this before logs and ratios are taken.
const MIN_MODEL_AMPLITUDE: f64 = 1e-30;

fn leg_value(vis: &Array1<c64>, leg: Leg) -> c64 {
    let v = vis[leg.index];
    if leg.conjugate {
        v.conj()
    } else {
        v
    }
}

/// Turn a gradient with respect to a leg's (possibly conjugated) value into
/// one with respect to the visibility.
fn leg_grad(g: c64, leg: Leg) -> c64 {
    if leg.conjugate {
        g.conj()
    } else {
        g
    }
}

pub(super) fn report_dropped(
    kind: DataTermKind,
    degenerate: usize,
    kept: usize,
    warnings: &mut Vec<ImagerWarning>,
) -> Result<(), ImagerError> {
    if degenerate > 0 {
        ImagerWarning::DegenerateMeasurement {
            count: degenerate,
            term: kind.to_string(),
        }
        .emit(warnings);
    }
    if kept == 0 {
        return Err(ImagerError::InvalidObservation(format!(
            "no usable {kind} data could be formed from the observation"
        )));
    }
    debug!("Using {kept} {kind} data");
    Ok(())
}

struct TriangleDatum {
    triangle: Triangle,
    value: c64,
    sigma: f64,
}

/// chi^2 = 1/(2N) sum |B - B_obs|^2 / sigma_B^2, where B is the triple
/// product of visibilities around a triangle.
pub struct BispectrumTerm {
    data: Vec<TriangleDatum>,
}

impl BispectrumTerm {
    pub fn new(
        obs: &FilteredObservation,
        closures: &ClosureSet,
        warnings: &mut Vec<ImagerWarning>,
    ) -> Result<BispectrumTerm, ImagerError> {
        let vis: Array1<c64> = obs.visibilities.iter().map(|v| v.vis).collect();
        let mut degenerate = 0;
        let data: Vec<TriangleDatum> = closures
            .triangles
            .iter()
            .filter_map(|&triangle| {
                let w = triangle.legs.map(|leg| leg_value(&vis, leg));
                let s = triangle.legs.map(|leg| obs.visibilities[leg.index].sigma);
                let sigma = ((s[0] * (w[1] * w[2]).norm()).powi(2)
                    + (s[1] * (w[0] * w[2]).norm()).powi(2)
                    + (s[2] * (w[0] * w[1]).norm()).powi(2))
                .sqrt();
                if sigma > 0.0 {
                    Some(TriangleDatum {
                        triangle,
                        value: w[0] * w[1] * w[2],
                        sigma,
                    })
                } else {
                    degenerate += 1;
                    None
                }
            })
            .collect();
        report_dropped(DataTermKind::Bispectrum, degenerate, data.len(), warnings)?;
        Ok(BispectrumTerm { data })
    }
}

impl VisibilityLoss for BispectrumTerm {
    fn accumulate(
        &self,
        predictions: &Predictions,
        weight: f64,
        grad: &mut VisGradient,
    ) -> Result<f64, ImagerError> {
        let model = predictions.get(Stokes::I, DataTermKind::Bispectrum)?;
        let n = self.data.len() as f64;

        let per_triangle: Vec<(f64, [c64; 3])> = self
            .data
            .par_iter()
            .map(|datum| {
                let legs = datum.triangle.legs;
                let w = legs.map(|leg| leg_value(model, leg));
                let residual = w[0] * w[1] * w[2] - datum.value;
                let inv_var = datum.sigma.powi(-2);
                let g_b = residual * (weight * inv_var / n);
                let others = [w[1] * w[2], w[0] * w[2], w[0] * w[1]];
                let g = [0, 1, 2].map(|k| leg_grad(g_b * others[k].conj(), legs[k]));
                (residual.norm_sqr() * inv_var, g)
            })
            .collect();

        let grad = grad.plane_mut(Stokes::I);
        let mut chi2 = 0.0;
        for (datum, (c, g)) in self.data.iter().zip(per_triangle) {
            chi2 += c;
            for (leg, g) in datum.triangle.legs.iter().zip(g) {
                grad[leg.index] += g;
            }
        }
        Ok(chi2 / (2.0 * n))
    }

    fn num_data(&self) -> usize {
        self.data.len()
    }
}

/// chi^2 = 2/N sum (1 - cos(psi_obs - psi)) / sigma_psi^2. The cosine makes
/// the residual insensitive to phase wrapping.
pub struct ClosurePhaseTerm {
    data: Vec<TriangleDatum>,
}

impl ClosurePhaseTerm {
    pub fn new(
        obs: &FilteredObservation,
        closures: &ClosureSet,
        warnings: &mut Vec<ImagerWarning>,
    ) -> Result<ClosurePhaseTerm, ImagerError> {
        let vis: Array1<c64> = obs.visibilities.iter().map(|v| v.vis).collect();
        let mut degenerate = 0;
        let data: Vec<TriangleDatum> = closures
            .triangles
            .iter()
            .filter_map(|&triangle| {
                let amps_and_sigmas = triangle.legs.map(|leg| {
                    let v = &obs.visibilities[leg.index];
                    (v.vis.norm(), v.sigma)
                });
                match relative_noise(&amps_and_sigmas) {
                    Some(sigma) => {
                        let w = triangle.legs.map(|leg| leg_value(&vis, leg));
                        Some(TriangleDatum {
                            triangle,
                            // Only the phase of this is used.
                            value: w[0] * w[1] * w[2],
                            sigma,
                        })
                    }
                    None => {
                        degenerate += 1;
                        None
                    }
                }
            })
            .collect();
        report_dropped(DataTermKind::ClosurePhase, degenerate, data.len(), warnings)?;
        Ok(ClosurePhaseTerm { data })
    }

    /// The observed closure phases \[radians\].
    pub fn observed_phases(&self) -> Vec<f64> {
        self.data.iter().map(|d| d.value.arg()).collect()
    }
}

impl VisibilityLoss for ClosurePhaseTerm {
    fn accumulate(
        &self,
        predictions: &Predictions,
        weight: f64,
        grad: &mut VisGradient,
    ) -> Result<f64, ImagerError> {
        let model = predictions.get(Stokes::I, DataTermKind::ClosurePhase)?;
        let n = self.data.len() as f64;

        let per_triangle: Vec<(f64, [c64; 3])> = self
            .data
            .par_iter()
            .map(|datum| {
                let legs = datum.triangle.legs;
                let w = legs.map(|leg| leg_value(model, leg));
                let delta = datum.value.arg() - (w[0] * w[1] * w[2]).arg();
                let inv_var = datum.sigma.powi(-2);
                // d chi^2 / d psi
                let d_psi = -2.0 * weight * delta.sin() * inv_var / n;
                // d arg(w) = i w / |w|^2
                let g = [0, 1, 2].map(|k| {
                    let amp_sq = w[k].norm_sqr();
                    if amp_sq > 0.0 {
                        leg_grad(c64::i() * w[k] * (d_psi / amp_sq), legs[k])
                    } else {
                        c64::new(0.0, 0.0)
                    }
                });
                ((1.0 - delta.cos()) * inv_var, g)
            })
            .collect();

        let grad = grad.plane_mut(Stokes::I);
        let mut chi2 = 0.0;
        for (datum, (c, g)) in self.data.iter().zip(per_triangle) {
            chi2 += c;
            for (leg, g) in datum.triangle.legs.iter().zip(g) {
                grad[leg.index] += g;
            }
        }
        Ok(2.0 * chi2 / n)
    }

    fn num_data(&self) -> usize {
        self.data.len()
    }
}

struct QuadrangleDatum {
    quadrangle: Quadrangle,
    value: f64,
    sigma: f64,
}

/// Closure amplitudes |V0| |V1| / (|V2| |V3|), compared either linearly or as
/// logs:
///
/// chi^2 = 1/N sum (C - C_obs)^2 / sigma_C^2
pub struct ClosureAmpTerm {
    data: Vec<QuadrangleDatum>,
    log: bool,
}

/// +1 for numerator amplitudes, -1 for denominator amplitudes.
const QUAD_SIGNS: [f64; 4] = [1.0, 1.0, -1.0, -1.0];

impl ClosureAmpTerm {
    pub fn new(
        obs: &FilteredObservation,
        closures: &ClosureSet,
        log: bool,
        settings: DataTermSettings,
        warnings: &mut Vec<ImagerWarning>,
    ) -> Result<ClosureAmpTerm, ImagerError> {
        let kind = if log {
            DataTermKind::LogClosureAmp
        } else {
            DataTermKind::ClosureAmp
        };

        let mut degenerate = 0;
        let mut low_snr = 0;
        let data: Vec<QuadrangleDatum> = closures
            .quadrangles
            .iter()
            .filter_map(|&quadrangle| {
                let amps_and_sigmas = quadrangle.indices.map(|i| {
                    let v = &obs.visibilities[i];
                    (settings.amp_debias.debias(v.vis.norm(), v.sigma), v.sigma)
                });
                let Some(rel_sigma) = relative_noise(&amps_and_sigmas) else {
                    degenerate += 1;
                    return None;
                };
                if 1.0 / rel_sigma < settings.closure_snr_cut {
                    low_snr += 1;
                    return None;
                }

                let [a0, a1, a2, a3] = amps_and_sigmas.map(|(a, _)| a);
                let (value, sigma) = if log {
                    (a0.ln() + a1.ln() - a2.ln() - a3.ln(), rel_sigma)
                } else {
                    let c = a0 * a1 / (a2 * a3);
                    (c, c * rel_sigma)
                };
                Some(QuadrangleDatum {
                    quadrangle,
                    value,
                    sigma,
                })
            })
            .collect();

        if low_snr > 0 {
            ImagerWarning::ClosureSnrCut {
                count: low_snr,
                snr_cut: settings.closure_snr_cut,
            }
            .emit(warnings);
        }
        report_dropped(kind, degenerate, data.len(), warnings)?;
        Ok(ClosureAmpTerm { data, log })
    }

    pub fn is_log(&self) -> bool {
        self.log
    }
}

impl VisibilityLoss for ClosureAmpTerm {
    fn accumulate(
        &self,
        predictions: &Predictions,
        weight: f64,
        grad: &mut VisGradient,
    ) -> Result<f64, ImagerError> {
        let kind = if self.log {
            DataTermKind::LogClosureAmp
        } else {
            DataTermKind::ClosureAmp
        };
        let model = predictions.get(Stokes::I, kind)?;
        let n = self.data.len() as f64;

        let per_quad: Vec<(f64, [c64; 4])> = self
            .data
            .par_iter()
            .map(|datum| {
                let v = datum.quadrangle.indices.map(|i| model[i]);
                let amps = v.map(|v| v.norm().max(MIN_MODEL_AMPLITUDE));
                let inv_var = datum.sigma.powi(-2);

                // The model closure quantity, and the factor that turns
                // d(log |V_k|) into d(quantity).
                let (value, scale) = if self.log {
                    let value = amps
                        .iter()
                        .zip(QUAD_SIGNS)
                        .map(|(a, s)| s * a.ln())
                        .sum::<f64>();
                    (value, 1.0)
                } else {
                    let c = amps[0] * amps[1] / (amps[2] * amps[3]);
                    (c, c)
                };
                let residual = value - datum.value;
                let d_value = 2.0 * weight * residual * inv_var / n;

                // d log|V| = V / |V|^2
                let g = [0, 1, 2, 3].map(|k| {
                    if v[k].norm_sqr() > 0.0 {
                        v[k] * (QUAD_SIGNS[k] * d_value * scale / v[k].norm_sqr())
                    } else {
                        c64::new(0.0, 0.0)
                    }
                });
                (residual * residual * inv_var, g)
            })
            .collect();

        let grad = grad.plane_mut(Stokes::I);
        let mut chi2 = 0.0;
        for (datum, (c, g)) in self.data.iter().zip(per_quad) {
            chi2 += c;
            for (&i, g) in datum.quadrangle.indices.iter().zip(g) {
                grad[i] += g;
            }
        }
        Ok(chi2 / n)
    }

    fn num_data(&self) -> usize {
        self.data.len()
    }
}
