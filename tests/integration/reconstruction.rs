// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Full reconstructions of simulated sources.

use vec1::vec1;
use vlbi_imager::{
    continuation::{StageReport, WeightedDataTerm, WeightedRegulariser},
    data_terms::DataTermKind,
    objective::Transform,
    optimiser::OptimiserStatus,
    regularisers::RegulariserKind,
    reconstruct, reconstruct_with_progress, ContinuationSchedule, ImagerConfig, Progress,
    StageConfig,
};

use super::*;

fn stage(
    data_terms: &[(DataTermKind, f64)],
    regularisers: &[(RegulariserKind, f64)],
    max_iterations: u32,
) -> StageConfig {
    let data_terms = data_terms
        .iter()
        .map(|&(kind, weight)| WeightedDataTerm { kind, weight })
        .collect::<Vec<_>>();
    StageConfig {
        data_terms: data_terms.try_into().unwrap(),
        regularisers: regularisers
            .iter()
            .map(|&(kind, weight)| WeightedRegulariser { kind, weight })
            .collect(),
        flux: Some(1.0),
        clip_floor: None,
        transform: Transform::Log,
        active_closure_terms: true,
        tolerance: None,
        max_iterations: Some(max_iterations),
        blur_fwhm_uas: None,
    }
}

fn chi_squared_of(report: &StageReport, kind: DataTermKind) -> f64 {
    report
        .chi_squared
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, c)| *c)
        .unwrap()
}

#[test]
fn test_gaussian_is_recovered() {
    let truth = gaussian_image(get_geometry(16, 8.0), 1.0, 30.0, (1.5, -1.0));
    let obs = observe(&truth, 12, 0.01, 100);
    let prior = gaussian_image(get_geometry(16, 8.0), 1.0, 60.0, (0.0, 0.0));

    let closures = stage(
        &[
            (DataTermKind::Amp, 1.0),
            (DataTermKind::ClosurePhase, 1.0),
        ],
        &[(RegulariserKind::GullSkilling, 1.0)],
        50,
    );
    let mut blurred = stage(
        &[(DataTermKind::Vis, 1.0)],
        &[
            (RegulariserKind::SimpleEntropy, 0.1),
            (RegulariserKind::TotalSquaredVariation, 0.1),
            (RegulariserKind::Flux, 1.0),
        ],
        100,
    );
    blurred.blur_fwhm_uas = Some(8.0);
    let schedule = ContinuationSchedule {
        stages: vec![closures, blurred],
    };
    let config = ImagerConfig::default();

    // What the prior itself achieves.
    let baseline_schedule = ContinuationSchedule {
        stages: vec![stage(&[(DataTermKind::Vis, 1.0)], &[], 0)],
    };
    let baseline = reconstruct(&obs, &prior, &baseline_schedule, &config).unwrap();
    let prior_chi_sq = chi_squared_of(&baseline.stages[0], DataTermKind::Vis);

    let mut iterations = vec![0; 2];
    let result = reconstruct_with_progress(&obs, &prior, &schedule, &config, |p: &Progress| {
        iterations[p.stage - 1] = p.iteration;
    })
    .unwrap();

    assert_eq!(result.stages.len(), 2);
    assert!(!result.target_reached);
    assert!(result.stages.iter().any(|s| s.accepted));
    for report in &result.stages {
        assert!(report.objective.is_finite());
        if !report.retried {
            assert_eq!(iterations[report.stage - 1], report.iterations);
        }
    }

    // The log transform keeps every pixel positive.
    assert!(result.image.stokes_i().iter().all(|&i| i > 0.0));
    let flux = result.image.total_flux();
    assert!((flux - 1.0).abs() < 0.2, "{flux}");

    // Closure phases and amplitudes don't know where the source is; only
    // visibilities fitted in the second stage do.
    let last = result.stages.iter().rev().find(|s| s.accepted).unwrap();
    if last.stage == 2 {
        let chi_sq = chi_squared_of(last, DataTermKind::Vis);
        assert!(chi_sq < 0.5 * prior_chi_sq, "{chi_sq} vs. {prior_chi_sq}");

        let (x, y) = result.image.centroid().unwrap();
        let (true_x, true_y) = truth.centroid().unwrap();
        let (prior_x, prior_y) = prior.centroid().unwrap();
        let distance = (x - true_x).hypot(y - true_y);
        let prior_distance = (prior_x - true_x).hypot(prior_y - true_y);
        assert!(distance < prior_distance, "{distance} vs. {prior_distance}");
    }
}

#[test]
fn test_polarisation_is_fit() {
    let mut truth = gaussian_image(get_geometry(8, 10.0), 1.0, 30.0, (0.0, 0.0));
    let i = truth.stokes_i().to_owned();
    truth.add_polarisation(Stokes::Q, &i * 0.1).unwrap();
    truth.add_polarisation(Stokes::U, &i * -0.05).unwrap();
    truth.add_polarisation(Stokes::V, &i * 0.02).unwrap();
    let obs = observe(&truth, 8, 0.01, 200);

    // Start from the right total intensity but no polarisation.
    let mut prior = truth.clone();
    for stokes in [Stokes::Q, Stokes::U, Stokes::V] {
        prior
            .add_polarisation(stokes, Array2::from_elem((8, 8), 1e-4))
            .unwrap();
    }

    let mut pol = stage(
        &[
            (DataTermKind::PolFraction, 1.0),
            (DataTermKind::CircularPol, 1.0),
        ],
        &[
            (RegulariserKind::PolFluxBound, 1.0),
            (RegulariserKind::PolEntropy, 0.01),
        ],
        50,
    );
    pol.transform = Transform::Linear;
    let schedule = ContinuationSchedule { stages: vec![pol] };
    let config = ImagerConfig::default();

    let mut baseline_schedule = schedule.clone();
    baseline_schedule.stages[0].max_iterations = Some(0);
    let baseline = reconstruct(&obs, &prior, &baseline_schedule, &config).unwrap();
    assert_eq!(
        baseline.stages[0].status,
        OptimiserStatus::MaxIterationsReached
    );

    let result = reconstruct(&obs, &prior, &schedule, &config).unwrap();
    let report = &result.stages[0];
    assert!(report.accepted, "{report:?}");
    for kind in [DataTermKind::PolFraction, DataTermKind::CircularPol] {
        let before = chi_squared_of(&baseline.stages[0], kind);
        let after = chi_squared_of(report, kind);
        assert!(after < before, "{kind}: {after} vs. {before}");
    }
    assert_eq!(result.image.pols(), truth.pols());
    assert!(report.objective < baseline.stages[0].objective);
}
