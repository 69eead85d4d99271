// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::f64::consts::TAU;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use rand::{rngs::StdRng, Rng, SeedableRng};
use strum::IntoEnumIterator;

use super::*;
use crate::{
    constants::UAS_TO_RAD,
    image::tests::get_geometry,
    model::Pulse,
    observation::{tests::get_observation, ClosureSelection, Observation, PolVisibility},
};

/// A random image with 20 uas pixels. Polarised images have Q, U and V
/// planes with fractional polarisation of up to 20%.
pub(crate) fn get_true_image(nx: usize, ny: usize, polarised: bool, seed: u64) -> Image {
    let mut geom = get_geometry(nx, ny);
    geom.pixel_size = 20.0 * UAS_TO_RAD;
    let mut rng = StdRng::seed_from_u64(seed);
    let i = Array2::from_shape_fn((ny, nx), |_| rng.gen_range(0.2..1.0));
    let mut image = Image::new(geom, i.clone()).unwrap();
    if polarised {
        for stokes in [Stokes::Q, Stokes::U, Stokes::V] {
            let plane = i.mapv(|i| i * rng.gen_range(-0.2..0.2));
            image.add_polarisation(stokes, plane).unwrap();
        }
    }
    image
}

/// A standard normal deviate (Box-Muller).
pub(crate) fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Observe `image` with the stations and times of [`get_observation`]. Every
/// measurement has 0.1 Jy noise; actual noise is only added if `noise_seed`
/// is given.
pub(crate) fn observe(
    image: &Image,
    num_stations: usize,
    num_times: usize,
    noise_seed: Option<u64>,
) -> Observation {
    let mut obs = get_observation(num_stations, num_times);
    let uvs: Vec<(f64, f64)> = obs.visibilities.iter().map(|v| (v.u, v.v)).collect();
    let model = ForwardModel::new(image.geometry(), &uvs, Pulse::Triangle);
    let predict = |s| image.stokes(s).map(|plane| model.forward(plane));
    let i = predict(Stokes::I).unwrap();
    let q = predict(Stokes::Q);
    let u = predict(Stokes::U);
    let v = predict(Stokes::V);

    let mut rng = noise_seed.map(StdRng::seed_from_u64);
    let mut noise = || match rng.as_mut() {
        Some(rng) => c64::new(0.1 * gaussian(rng), 0.1 * gaussian(rng)),
        None => c64::new(0.0, 0.0),
    };
    let zero = c64::new(0.0, 0.0);
    for (k, vis) in obs.visibilities.iter_mut().enumerate() {
        vis.vis = i[k] + noise();
        if image.pols().len() > 1 {
            vis.pol = Some(PolVisibility {
                q: q.as_ref().map_or(zero, |q| q[k]) + noise(),
                u: u.as_ref().map_or(zero, |u| u[k]) + noise(),
                v: v.as_ref().map_or(zero, |v| v[k]) + noise(),
                sigma_q: 0.1,
                sigma_u: 0.1,
                sigma_v: 0.1,
            });
        }
    }
    obs
}

fn no_debias() -> DataTermSettings {
    DataTermSettings {
        amp_debias: AmpDebias::None,
        closure_snr_cut: 0.0,
    }
}

/// Scale every pixel of every plane by a random factor in [0.8, 1.2).
fn perturb(image: &Image, seed: u64) -> Image {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = image.data().mapv(|p| p * rng.gen_range(0.8..1.2));
    image.with_data(data)
}

fn check_gradient(term: &DataTerm, image: &Image, model: &ForwardModel) {
    let eval = term.evaluate(image, model).unwrap();
    let h = 1e-7;
    for (index, &g) in eval.gradient.indexed_iter() {
        let mut plus = image.data().to_owned();
        plus[index] += h;
        let mut minus = image.data().to_owned();
        minus[index] -= h;
        let f_plus = term.evaluate(&image.with_data(plus), model).unwrap().value;
        let f_minus = term.evaluate(&image.with_data(minus), model).unwrap().value;
        let fd = (f_plus - f_minus) / (2.0 * h);
        assert_relative_eq!(g, fd, epsilon = 1e-4, max_relative = 1e-4);
    }
}

#[test]
fn test_every_term_is_zero_at_the_truth() {
    let truth = get_true_image(3, 3, true, 1);
    let obs = observe(&truth, 5, 2, None)
        .filtered(0.0, &mut vec![])
        .unwrap();
    let closures = ClosureSet::new(&obs, ClosureSelection::All);
    let model = ForwardModel::new(truth.geometry(), &obs.uvs(), Pulse::Triangle);

    for kind in DataTermKind::iter() {
        let mut warnings = vec![];
        let term = DataTerm::new(kind, &obs, &closures, no_debias(), &mut warnings).unwrap();
        assert_eq!(term.kind(), kind);
        assert!(warnings.is_empty(), "{kind}: {warnings:?}");
        let eval = term.evaluate(&truth, &model).unwrap();
        assert_abs_diff_eq!(eval.value, 0.0, epsilon = 1e-16);
        assert_abs_diff_eq!(
            eval.gradient,
            Array3::<f64>::zeros(truth.dim()),
            epsilon = 1e-8
        );
    }
}

#[test]
fn test_every_gradient_matches_finite_differences() {
    let truth = get_true_image(3, 3, true, 2);
    let obs = observe(&truth, 5, 2, None)
        .filtered(0.0, &mut vec![])
        .unwrap();
    let closures = ClosureSet::new(&obs, ClosureSelection::All);
    let model = ForwardModel::new(truth.geometry(), &obs.uvs(), Pulse::Triangle);
    let image = perturb(&truth, 3);

    for kind in DataTermKind::iter() {
        let term =
            DataTerm::new(kind, &obs, &closures, DataTermSettings::default(), &mut vec![]).unwrap();
        let value = term.evaluate(&image, &model).unwrap().value;
        assert!(value > 0.0, "{kind} should not fit a perturbed image");
        check_gradient(&term, &image, &model);
    }
}

#[test]
fn test_closure_phases_ignore_station_phase_errors() {
    let truth = get_true_image(4, 4, false, 4);
    let clean = observe(&truth, 5, 2, None);
    let mut corrupted = clean.clone();
    let station_error = |name: &str| match name {
        "ALMA" => c64::from_polar(1.3, 0.3),
        "APEX" => c64::from_polar(0.7, -1.2),
        "JCMT" => c64::from_polar(1.1, 2.5),
        "LMT" => c64::from_polar(0.9, 0.7),
        _ => c64::from_polar(1.6, -2.9),
    };
    for vis in corrupted.visibilities.iter_mut() {
        vis.vis *= station_error(&vis.station1) * station_error(&vis.station2).conj();
    }

    let clean = clean.filtered(0.0, &mut vec![]).unwrap();
    let corrupted = corrupted.filtered(0.0, &mut vec![]).unwrap();
    let closures = ClosureSet::new(&clean, ClosureSelection::All);
    let model = ForwardModel::new(truth.geometry(), &clean.uvs(), Pulse::Triangle);

    let clean_term = ClosurePhaseTerm::new(&clean, &closures, &mut vec![]).unwrap();
    let corrupted_term = ClosurePhaseTerm::new(&corrupted, &closures, &mut vec![]).unwrap();
    for (a, b) in clean_term
        .observed_phases()
        .into_iter()
        .zip(corrupted_term.observed_phases())
    {
        assert_abs_diff_eq!((a - b).cos(), 1.0, epsilon = 1e-12);
    }

    // The truth still fits closure phases and log closure amplitudes
    // perfectly, but not the visibilities themselves.
    for (kind, fits) in [
        (DataTermKind::ClosurePhase, true),
        (DataTermKind::LogClosureAmp, true),
        (DataTermKind::Vis, false),
    ] {
        let term = DataTerm::new(kind, &corrupted, &closures, no_debias(), &mut vec![]).unwrap();
        let value = term.evaluate(&truth, &model).unwrap().value;
        if fits {
            assert_abs_diff_eq!(value, 0.0, epsilon = 1e-12);
        } else {
            assert!(value > 1.0);
        }
    }
}

#[test]
fn test_closure_phases_ignore_image_shifts() {
    // A compact source away from the edges, so a shift is a pure translation.
    let mut geom = get_geometry(6, 6);
    geom.pixel_size = 20.0 * UAS_TO_RAD;
    let mut pixels = Array2::zeros((6, 6));
    pixels[(2, 2)] = 1.0;
    pixels[(2, 3)] = 0.5;
    pixels[(3, 2)] = 0.25;
    let truth = Image::new(geom.clone(), pixels.clone()).unwrap();
    let mut shifted_pixels = Array2::zeros((6, 6));
    shifted_pixels
        .slice_mut(s![1.., 1..])
        .assign(&pixels.slice(s![..5, ..5]));
    let shifted = Image::new(geom, shifted_pixels).unwrap();

    let obs = observe(&truth, 5, 2, None)
        .filtered(0.0, &mut vec![])
        .unwrap();
    let closures = ClosureSet::new(&obs, ClosureSelection::All);
    let model = ForwardModel::new(truth.geometry(), &obs.uvs(), Pulse::Triangle);
    let cphase = DataTerm::new(
        DataTermKind::ClosurePhase,
        &obs,
        &closures,
        no_debias(),
        &mut vec![],
    )
    .unwrap();
    let vis = DataTerm::new(DataTermKind::Vis, &obs, &closures, no_debias(), &mut vec![]).unwrap();

    assert_abs_diff_eq!(
        cphase.evaluate(&shifted, &model).unwrap().value,
        0.0,
        epsilon = 1e-12
    );
    assert!(vis.evaluate(&shifted, &model).unwrap().value > 0.0);
}

#[test]
fn test_amp_debias_policies() {
    assert_abs_diff_eq!(AmpDebias::None.debias(1.0, 0.6), 1.0);
    assert_abs_diff_eq!(AmpDebias::Quadrature.debias(1.0, 0.6), 0.8, epsilon = 1e-15);
    assert_abs_diff_eq!(AmpDebias::QuadratureFloor.debias(1.0, 0.6), 0.8, epsilon = 1e-15);
    // Below the noise.
    assert_abs_diff_eq!(AmpDebias::Quadrature.debias(0.5, 0.6), 0.5);
    assert_abs_diff_eq!(AmpDebias::QuadratureFloor.debias(0.5, 0.6), 0.0);
}

#[test]
fn test_debiased_amplitudes_are_smaller() {
    let truth = get_true_image(3, 3, false, 5);
    let obs = observe(&truth, 4, 1, None)
        .filtered(0.0, &mut vec![])
        .unwrap();
    let model = ForwardModel::new(truth.geometry(), &obs.uvs(), Pulse::Triangle);
    let term = DataTerm::Amp(AmpTerm::new(&obs, AmpDebias::Quadrature));
    // The truth is now slightly too bright for every amplitude, so dimming it
    // must improve the fit.
    let eval = term.evaluate(&truth, &model).unwrap();
    assert!(eval.value > 0.0);
    assert!((&eval.gradient * &truth.data()).sum() > 0.0);
}

#[test]
fn test_reduced_chi2_of_truth_is_near_one() {
    let truth = get_true_image(4, 4, false, 6);
    let obs = observe(&truth, 5, 20, Some(42))
        .filtered(0.0, &mut vec![])
        .unwrap();
    assert_eq!(obs.len(), 200);
    let model = ForwardModel::new(truth.geometry(), &obs.uvs(), Pulse::Triangle);
    let term = DataTerm::Vis(VisTerm::new(&obs));
    let chi2 = term.evaluate(&truth, &model).unwrap().value;
    assert!((0.75..1.25).contains(&chi2), "chi2 = {chi2}");
}

#[test]
fn test_closure_snr_cut() {
    let truth = get_true_image(3, 3, false, 7);
    let obs = observe(&truth, 5, 2, None)
        .filtered(0.0, &mut vec![])
        .unwrap();
    let closures = ClosureSet::new(&obs, ClosureSelection::All);
    let settings = DataTermSettings {
        amp_debias: AmpDebias::None,
        closure_snr_cut: 1e9,
    };
    let mut warnings = vec![];
    let result = DataTerm::new(
        DataTermKind::LogClosureAmp,
        &obs,
        &closures,
        settings,
        &mut warnings,
    );
    assert!(matches!(result, Err(ImagerError::InvalidObservation(_))));
    assert_eq!(
        warnings,
        vec![ImagerWarning::ClosureSnrCut {
            count: 20,
            snr_cut: 1e9
        }]
    );
}

#[test]
fn test_visibilities_without_polarimetry_are_reported() {
    let truth = get_true_image(3, 3, true, 8);
    let mut obs = observe(&truth, 4, 2, None);
    for vis in obs.visibilities.iter_mut().take(3) {
        vis.pol = None;
    }
    let obs = obs.filtered(0.0, &mut vec![]).unwrap();

    let mut warnings = vec![];
    let term = DataTerm::new(
        DataTermKind::PolFraction,
        &obs,
        &ClosureSet::default(),
        no_debias(),
        &mut warnings,
    )
    .unwrap();
    assert_eq!(term.num_data(), obs.len() - 3);
    assert_eq!(
        warnings,
        vec![ImagerWarning::NoPolarimetry {
            count: 3,
            term: "pol_fraction".to_string()
        }]
    );
}

#[test]
fn test_missing_polarisation_is_fatal() {
    let truth = get_true_image(3, 3, true, 9);
    let obs = observe(&truth, 4, 1, None)
        .filtered(0.0, &mut vec![])
        .unwrap();
    let model = ForwardModel::new(truth.geometry(), &obs.uvs(), Pulse::Triangle);
    let term = DataTerm::new(
        DataTermKind::CircularPol,
        &obs,
        &ClosureSet::default(),
        no_debias(),
        &mut vec![],
    )
    .unwrap();

    let stokes_i_only = Image::new(truth.geometry().clone(), truth.stokes_i().to_owned()).unwrap();
    assert!(matches!(
        term.evaluate(&stokes_i_only, &model),
        Err(ImagerError::MissingPolarisation {
            stokes: Stokes::V,
            ..
        })
    ));
}

#[test]
fn test_closure_terms_need_closures() {
    let truth = get_true_image(3, 3, false, 10);
    let obs = observe(&truth, 2, 1, None)
        .filtered(0.0, &mut vec![])
        .unwrap();
    let closures = ClosureSet::new(&obs, ClosureSelection::All);
    assert!(closures.triangles.is_empty());
    let result = DataTerm::new(
        DataTermKind::ClosurePhase,
        &obs,
        &closures,
        no_debias(),
        &mut vec![],
    );
    assert!(matches!(result, Err(ImagerError::InvalidObservation(_))));
}
