// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reconstruct an image by running the optimiser over a schedule of stages.
//!
//! Each stage starts from the image the last successful stage produced (or
//! the prior) and minimises its own weighted objective. A stage whose line
//! search fails doesn't abort the reconstruction; its image is discarded and
//! the stage is either retried once with a smaller step bound or skipped.
//!
//! Stages that only constrain Stokes I carry each pixel's fractional
//! polarisation over from their seed.

mod schedule;

pub use schedule::*;

use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use ndarray::Array1;
use serde::Serialize;

use crate::{
    constants::UAS_TO_RAD,
    data_terms::{DataTerm, DataTermKind},
    image::Image,
    model::ForwardModel,
    objective::{ImageObjective, ObjectiveAssembler},
    observation::{ClosureSet, FilteredObservation, Observation},
    optimiser::{Optimiser, OptimiserConfig, OptimiserOutcome, OptimiserStatus},
    regularisers::{Regulariser, RegulariserKind},
    ImagerError, ImagerWarning, PROGRESS_BARS,
};

/// Passed to a progress callback after every accepted optimiser step.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    /// Starting from 1.
    pub stage: usize,
    pub iteration: u32,
    pub objective: f64,
    pub chi_squared: &'a [(DataTermKind, f64)],
}

/// How a stage went.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// Starting from 1.
    pub stage: usize,
    pub status: OptimiserStatus,
    pub retried: bool,
    pub iterations: u32,

    /// The objective at the stage's final image.
    pub objective: f64,
    pub chi_squared: Vec<(DataTermKind, f64)>,
    pub regularisers: Vec<(RegulariserKind, f64)>,

    /// Whether the stage's image was kept.
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// The image of the last accepted stage, or the prior if none were.
    pub image: Image,

    /// The status of the last stage run. `None` if no stages ran.
    pub status: Option<OptimiserStatus>,

    /// Whether the chi-squared target stopped the schedule early.
    pub target_reached: bool,

    pub stages: Vec<StageReport>,
    pub warnings: Vec<ImagerWarning>,
}

/// Reconstruct an image of `obs`, starting from `prior`.
pub fn reconstruct(
    obs: &Observation,
    prior: &Image,
    schedule: &ContinuationSchedule,
    config: &ImagerConfig,
) -> Result<Reconstruction, ImagerError> {
    reconstruct_inner(obs, prior, schedule, config, None)
}

/// As [`reconstruct`], but `progress` is called after every accepted
/// optimiser step.
pub fn reconstruct_with_progress<F: FnMut(&Progress)>(
    obs: &Observation,
    prior: &Image,
    schedule: &ContinuationSchedule,
    config: &ImagerConfig,
    mut progress: F,
) -> Result<Reconstruction, ImagerError> {
    reconstruct_inner(obs, prior, schedule, config, Some(&mut progress))
}

fn reconstruct_inner(
    obs: &Observation,
    prior: &Image,
    schedule: &ContinuationSchedule,
    config: &ImagerConfig,
    mut progress: Option<&mut (dyn FnMut(&Progress) + '_)>,
) -> Result<Reconstruction, ImagerError> {
    config.validate()?;
    schedule.validate()?;

    let mut warnings = vec![];
    if schedule.stages.is_empty() {
        info!("No stages to run; the prior is the result");
        return Ok(Reconstruction {
            image: prior.clone(),
            status: None,
            target_reached: false,
            stages: vec![],
            warnings,
        });
    }

    let obs = obs.filtered(config.systematic_noise, &mut warnings)?;
    check_limits(&obs, prior, &mut warnings);

    let active_kinds = || {
        schedule
            .stages
            .iter()
            .flat_map(|s| s.active_data_terms())
            .map(|t| t.kind)
    };
    let closures = if active_kinds().any(DataTermKind::uses_closures) {
        ClosureSet::new(&obs, config.closure_selection)
    } else {
        ClosureSet::default()
    };
    let model = ForwardModel::new(prior.geometry(), &obs.uvs(), config.pulse);

    // Data terms are the same for every stage; only their weights change.
    let mut data_terms = BTreeMap::new();
    for kind in active_kinds() {
        if !data_terms.contains_key(&kind) {
            let term = DataTerm::new(
                kind,
                &obs,
                &closures,
                config.data_term_settings(),
                &mut warnings,
            )?;
            debug!("{kind} data term has {} data", term.num_data());
            data_terms.insert(kind, term);
        }
    }

    let mut image = prior.clone();
    let mut status = None;
    let mut target_reached = false;
    let mut reports = Vec::with_capacity(schedule.stages.len());
    for (i_stage, stage) in schedule.stages.iter().enumerate() {
        let stage_num = i_stage + 1;
        let (stage_prior, seed) = match stage.flux {
            Some(flux) => (prior.with_total_flux(flux), image.with_total_flux(flux)),
            None => (prior.clone(), image.clone()),
        };
        let seed = match stage.blur_fwhm_uas {
            Some(fwhm) => seed.blur(fwhm * UAS_TO_RAD),
            None => seed,
        };
        let flux = stage.flux.unwrap_or_else(|| prior.total_flux());

        let regularisers = stage
            .regularisers
            .iter()
            .map(|r| {
                Regulariser::new(r.kind, &stage_prior, flux, config.regularisers)
                    .map(|reg| (reg, r.weight))
            })
            .collect::<Result<Vec<_>, _>>()?;
        // Every entropy clamps the same prior, so don't count it twice.
        let prior_clamped = regularisers
            .iter()
            .map(|(reg, _)| reg.clamped_prior_pixels())
            .max()
            .unwrap_or(0);
        if prior_clamped > 0 {
            ImagerWarning::NonPositiveFlux {
                stage: stage_num,
                count: prior_clamped,
                floor: config.regularisers.entropy_floor,
            }
            .emit(&mut warnings);
        }
        let weighted_terms = stage
            .active_data_terms()
            .filter_map(|t| data_terms.get(&t.kind).map(|term| (term, t.weight)))
            .collect();
        let assembler = ObjectiveAssembler::new(&model, weighted_terms, regularisers)?;
        let objective =
            ImageObjective::new(&assembler, &stage_prior, stage.clip_floor, stage.transform);
        let x0 = objective.to_params(&seed)?;

        let mut stage_config = config.optimiser;
        if let Some(tol) = stage.tolerance {
            stage_config.ftol = tol;
        }
        if let Some(max_iterations) = stage.max_iterations {
            stage_config.max_iterations = max_iterations;
        }

        info!(
            "Stage {stage_num}/{}: {} free parameters; data terms: {}; regularisers: {}",
            schedule.stages.len(),
            objective.num_active_pixels() * stage_prior.pols().len(),
            describe(assembler.data_terms().map(|(t, w)| (t.kind().to_string(), w))),
            describe(assembler.regularisers().map(|(r, w)| (r.kind().to_string(), w))),
        );

        let mut outcome = run_stage(
            &objective,
            &assembler,
            x0.clone(),
            stage_config,
            stage_num,
            progress.as_deref_mut(),
        )?;
        let mut retried = false;
        if outcome.status == OptimiserStatus::LineSearchFailed
            && config.stage_failure == StageFailurePolicy::RetryRelaxed
        {
            let relaxed = OptimiserConfig {
                max_step: stage_config.max_step * config.retry_step_scale,
                max_shrinks: stage_config.max_shrinks.saturating_mul(2).max(1),
                ..stage_config
            };
            info!(
                "Stage {stage_num}: the line search failed; retrying with a maximum step of {:e}",
                relaxed.max_step
            );
            outcome = run_stage(
                &objective,
                &assembler,
                x0,
                relaxed,
                stage_num,
                progress.as_deref_mut(),
            )?;
            retried = true;
        }

        let mut stage_image = objective.to_image(outcome.x.view());
        if !assembler.constrains_polarisation() {
            stage_image.keep_polarisation_fraction(&seed);
        }
        let eval = assembler.evaluate(&stage_image)?;
        if eval.clamped > 0 {
            ImagerWarning::NonPositiveFlux {
                stage: stage_num,
                count: eval.clamped,
                floor: config.regularisers.entropy_floor,
            }
            .emit(&mut warnings);
        }
        match outcome.status {
            OptimiserStatus::LineSearchFailed => ImagerWarning::LineSearchFailure {
                stage: stage_num,
                iterations: outcome.iterations,
                retried,
            }
            .emit(&mut warnings),
            OptimiserStatus::MaxIterationsReached => ImagerWarning::ConvergenceNotReached {
                stage: stage_num,
                max_iterations: stage_config.max_iterations,
            }
            .emit(&mut warnings),
            _ => (),
        }

        let accepted = outcome.status != OptimiserStatus::LineSearchFailed;
        info!(
            "Stage {stage_num}: {} after {} iterations; objective {:e}; chi-squared: {}",
            outcome.status,
            outcome.iterations,
            eval.total,
            describe(eval.data_terms.iter().map(|(k, c)| (k.to_string(), *c))),
        );
        let reached = accepted
            && config
                .chi_squared_target
                .map_or(false, |target| eval.data_terms.iter().all(|&(_, c)| c <= target));
        reports.push(StageReport {
            stage: stage_num,
            status: outcome.status,
            retried,
            iterations: outcome.iterations,
            objective: eval.total,
            chi_squared: eval.data_terms,
            regularisers: eval.regularisers,
            accepted,
        });
        status = Some(outcome.status);
        if accepted {
            image = stage_image;
        }
        if reached {
            info!("The chi-squared target was reached after stage {stage_num}");
            target_reached = true;
            break;
        }
    }

    Ok(Reconstruction {
        image,
        status,
        target_reached,
        stages: reports,
        warnings,
    })
}

/// Run one optimiser to completion, drawing a progress bar if they're
/// enabled.
fn run_stage(
    objective: &ImageObjective,
    assembler: &ObjectiveAssembler,
    x0: Array1<f64>,
    config: OptimiserConfig,
    stage: usize,
    mut progress: Option<&mut (dyn FnMut(&Progress) + '_)>,
) -> Result<OptimiserOutcome, ImagerError> {
    let mut optimiser = Optimiser::new(objective, x0, config)?;

    let progress_bar = ProgressBar::with_draw_target(
        Some(config.max_iterations as _),
        if PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg}: [{wide_bar:.blue}] {pos:3}/{len:3} ({elapsed_precise}<{eta_precise})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    )
    .with_position(0)
    .with_message(format!("Stage {stage}"));

    loop {
        let before = optimiser.iteration();
        let status = optimiser.step()?;
        if optimiser.iteration() > before {
            progress_bar.inc(1);
            if let Some(callback) = progress.as_deref_mut() {
                let image = objective.to_image(optimiser.x());
                let chi_squared = assembler.chi_squared(&image)?;
                callback(&Progress {
                    stage,
                    iteration: optimiser.iteration(),
                    objective: optimiser.value(),
                    chi_squared: &chi_squared,
                });
            }
        }
        if status.is_terminal() {
            break;
        }
    }
    progress_bar.abandon_with_message(format!("Stage {stage}: {}", optimiser.status()));

    Ok(optimiser.into_outcome())
}

/// Warn if the image can't represent the data well. The pixels should
/// resolve the longest baseline, the field of view should contain the
/// shortest one's fringe, and the prior's flux should be close to the largest
/// visibility amplitude.
fn check_limits(obs: &FilteredObservation, prior: &Image, warnings: &mut Vec<ImagerWarning>) {
    let geometry = prior.geometry();
    if let Some((min_baseline, max_baseline)) = obs.uv_range() {
        let smallest_wavelength = 1.0 / max_baseline;
        if geometry.pixel_size > smallest_wavelength {
            ImagerWarning::PixelTooCoarse {
                pixel_spacing: geometry.pixel_size,
                smallest_wavelength,
            }
            .emit(warnings);
        }
        let largest_wavelength = 1.0 / min_baseline;
        if geometry.field_of_view() < largest_wavelength {
            ImagerWarning::FieldOfViewTooSmall {
                fov: geometry.field_of_view(),
                largest_wavelength,
            }
            .emit(warnings);
        }
    }

    let flux = prior.total_flux();
    let max_amp = obs.max_amplitude();
    if max_amp > 0.0 && !(0.8 * max_amp..=1.2 * max_amp).contains(&flux) {
        ImagerWarning::FluxMismatch { flux, max_amp }.emit(warnings);
    }
}

fn describe<I: Iterator<Item = (String, f64)>>(items: I) -> String {
    let s = items
        .map(|(name, value)| format!("{name} ({value:.3})"))
        .collect::<Vec<_>>()
        .join(", ");
    if s.is_empty() {
        "none".to_string()
    } else {
        s
    }
}
