// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::{assert_abs_diff_eq, assert_relative_eq};
use strum::IntoEnumIterator;

use super::*;
use crate::data_terms::tests::get_true_image;

fn get_regulariser(kind: RegulariserKind, prior: &Image) -> Regulariser {
    Regulariser::new(kind, prior, prior.total_flux(), RegulariserSettings::default()).unwrap()
}

fn check_gradient(reg: &Regulariser, image: &Image) {
    let eval = reg.evaluate(image).unwrap();
    let h = 1e-7;
    for (index, &g) in eval.gradient.indexed_iter() {
        let mut plus = image.data().to_owned();
        plus[index] += h;
        let mut minus = image.data().to_owned();
        minus[index] -= h;
        let f_plus = reg.evaluate(&image.with_data(plus)).unwrap().value;
        let f_minus = reg.evaluate(&image.with_data(minus)).unwrap().value;
        let fd = (f_plus - f_minus) / (2.0 * h);
        assert_relative_eq!(g, fd, epsilon = 1e-6, max_relative = 1e-4);
    }
}

#[test]
fn test_entropies_are_zero_at_the_prior() {
    let prior = get_true_image(4, 4, false, 1);
    for kind in [RegulariserKind::SimpleEntropy, RegulariserKind::GullSkilling] {
        let eval = get_regulariser(kind, &prior).evaluate(&prior).unwrap();
        assert_abs_diff_eq!(eval.value, 0.0, epsilon = 1e-15);
        assert_eq!(eval.clamped, 0);
    }

    // Gull-Skilling is also stationary there.
    let eval = get_regulariser(RegulariserKind::GullSkilling, &prior)
        .evaluate(&prior)
        .unwrap();
    assert_abs_diff_eq!(eval.gradient, Array3::<f64>::zeros(prior.dim()), epsilon = 1e-15);
}

#[test]
fn test_gull_skilling_is_never_negative() {
    let prior = get_true_image(4, 4, false, 2);
    let reg = get_regulariser(RegulariserKind::GullSkilling, &prior);
    for seed in 3..8 {
        let image = get_true_image(4, 4, false, seed);
        assert!(reg.evaluate(&image).unwrap().value > 0.0);
    }
}

#[test]
fn test_smoothness_is_zero_for_a_flat_image() {
    let mut flat = get_true_image(5, 4, false, 3);
    flat.data_mut().fill(0.3);
    for kind in [
        RegulariserKind::TotalVariation,
        RegulariserKind::TotalSquaredVariation,
    ] {
        let eval = get_regulariser(kind, &flat).evaluate(&flat).unwrap();
        assert_abs_diff_eq!(eval.value, 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(eval.gradient, Array3::<f64>::zeros(flat.dim()), epsilon = 1e-12);
    }
}

#[test]
fn test_total_variation_of_a_step() {
    let mut image = get_true_image(4, 3, false, 4);
    {
        let mut data = image.data_mut();
        data.fill(0.0);
        data.slice_mut(s![0, .., 2..]).fill(1.0);
    }
    // One unit step per row, three rows, normalised by the flux (6 Jy).
    let reg = Regulariser::TotalVariation {
        flux: 6.0,
        epsilon: 1e-12,
    };
    assert_abs_diff_eq!(reg.evaluate(&image).unwrap().value, 3.0 / 6.0, epsilon = 1e-10);
}

#[test]
fn test_moments_are_zero_at_their_minimum() {
    // A single pixel in the centre.
    let mut point = get_true_image(5, 5, false, 5);
    {
        let mut data = point.data_mut();
        data.fill(0.0);
        data[(0, 2, 2)] = 2.0;
    }
    for kind in [
        RegulariserKind::Compactness,
        RegulariserKind::Centroid,
        RegulariserKind::Flux,
    ] {
        let eval = get_regulariser(kind, &point).evaluate(&point).unwrap();
        assert_abs_diff_eq!(eval.value, 0.0, epsilon = 1e-15);
    }

    // Moving the pixel changes the centroid, but not the compactness.
    let mut moved = point.clone();
    {
        let mut data = moved.data_mut();
        data[(0, 2, 2)] = 0.0;
        data[(0, 0, 4)] = 2.0;
    }
    let centroid = get_regulariser(RegulariserKind::Centroid, &point);
    assert_abs_diff_eq!(centroid.evaluate(&moved).unwrap().value, 8.0, epsilon = 1e-12);
    let compactness = get_regulariser(RegulariserKind::Compactness, &point);
    assert_abs_diff_eq!(compactness.evaluate(&moved).unwrap().value, 0.0, epsilon = 1e-12);

    // Two pixels four apart have a variance of 4.
    let mut pair = point.clone();
    pair.data_mut()[(0, 2, 0)] = 2.0;
    pair.data_mut()[(0, 2, 4)] = 2.0;
    pair.data_mut()[(0, 2, 2)] = 0.0;
    assert_abs_diff_eq!(compactness.evaluate(&pair).unwrap().value, 4.0, epsilon = 1e-12);

    let mut empty = point.clone();
    empty.data_mut().fill(0.0);
    assert_abs_diff_eq!(compactness.evaluate(&empty).unwrap().value, 0.0);
    assert!(get_regulariser(RegulariserKind::L1, &point)
        .evaluate(&empty)
        .unwrap()
        .value
        .abs()
        < 1e-20);
}

#[test]
fn test_polarimetric_regularisers_are_zero_without_polarisation() {
    let mut image = get_true_image(3, 3, true, 6);
    image
        .data_mut()
        .slice_mut(s![1.., .., ..])
        .fill(0.0);
    for kind in [RegulariserKind::PolEntropy, RegulariserKind::PolFluxBound] {
        let eval = get_regulariser(kind, &image).evaluate(&image).unwrap();
        assert_abs_diff_eq!(eval.value, 0.0, epsilon = 1e-15);
    }

    // Modest polarisation is not penalised by the bound, but is by the
    // entropy.
    let image = get_true_image(3, 3, true, 7);
    let bound = get_regulariser(RegulariserKind::PolFluxBound, &image);
    assert_abs_diff_eq!(bound.evaluate(&image).unwrap().value, 0.0);
    let entropy = get_regulariser(RegulariserKind::PolEntropy, &image);
    assert!(entropy.evaluate(&image).unwrap().value > 0.0);
}

#[test]
fn test_every_gradient_matches_finite_differences() {
    let prior = get_true_image(4, 3, true, 8);
    let image = get_true_image(4, 3, true, 9);
    for kind in RegulariserKind::iter() {
        let reg = get_regulariser(kind, &prior);
        check_gradient(&reg, &image);
    }
}

#[test]
fn test_pol_flux_bound_gradient_when_over_polarised() {
    let mut image = get_true_image(3, 3, true, 10);
    {
        let mut data = image.data_mut();
        let stokes_i = data.index_axis(Axis(0), 0).to_owned();
        data.index_axis_mut(Axis(0), 1).assign(&(&stokes_i * 1.5));
    }
    let reg = get_regulariser(RegulariserKind::PolFluxBound, &image);
    let eval = reg.evaluate(&image).unwrap();
    assert!(eval.value > 0.0);
    // More Stokes I reduces the penalty.
    assert!(eval.gradient.index_axis(Axis(0), 0).iter().all(|&g| g < 0.0));
    check_gradient(&reg, &image);
}

#[test]
fn test_entropy_clamps_and_counts_non_positive_pixels() {
    let prior = get_true_image(3, 3, false, 11);
    let mut image = prior.clone();
    image.data_mut()[(0, 0, 0)] = 0.0;
    image.data_mut()[(0, 1, 1)] = -0.5;
    for kind in [RegulariserKind::SimpleEntropy, RegulariserKind::GullSkilling] {
        let reg = get_regulariser(kind, &prior);
        assert_eq!(reg.clamped_prior_pixels(), 0);
        let eval = reg.evaluate(&image).unwrap();
        assert_eq!(eval.clamped, 2);
        assert!(eval.value.is_finite());
        assert!(eval.gradient.iter().all(|g| g.is_finite()));
        // The clamped pixels want to grow.
        assert!(eval.gradient[(0, 1, 1)] < 0.0);
    }
}

#[test]
fn test_entropy_below_the_floor_matches_its_gradient() {
    let prior = get_true_image(3, 3, false, 14);
    let mut image = prior.clone();
    image.data_mut()[(0, 1, 1)] = -0.5;
    image.data_mut()[(0, 2, 0)] = -1e-3;
    for kind in [RegulariserKind::SimpleEntropy, RegulariserKind::GullSkilling] {
        let reg = get_regulariser(kind, &prior);
        check_gradient(&reg, &image);

        // Moving further below the floor keeps increasing the entropy.
        let eval = reg.evaluate(&image).unwrap();
        let mut lower = image.clone();
        lower.data_mut()[(0, 1, 1)] = -1.0;
        assert!(reg.evaluate(&lower).unwrap().value > eval.value);
    }
}

#[test]
fn test_pol_entropy_below_the_floor_matches_its_gradient() {
    let mut image = get_true_image(3, 3, true, 15);
    {
        let mut data = image.data_mut();
        data.index_axis_mut(Axis(0), 0).fill(1.0);
        data.index_axis_mut(Axis(0), 1).fill(0.1);
        data.index_axis_mut(Axis(0), 2).fill(0.05);
        data.index_axis_mut(Axis(0), 3).fill(0.02);
        data[(0, 1, 1)] = -0.05;
        data[(1, 1, 1)] = 0.02;
        data[(2, 1, 1)] = 0.01;
        data[(3, 1, 1)] = 0.0;
    }
    let settings = RegulariserSettings {
        entropy_floor: 0.1,
        ..Default::default()
    };
    let reg = Regulariser::new(RegulariserKind::PolEntropy, &image, 9.0, settings).unwrap();
    assert_eq!(reg.evaluate(&image).unwrap().clamped, 1);
    check_gradient(&reg, &image);
}

#[test]
fn test_non_positive_prior_pixels_are_counted() {
    let mut prior = get_true_image(3, 3, false, 16);
    prior.data_mut()[(0, 0, 2)] = 0.0;
    prior.data_mut()[(0, 2, 2)] = -0.1;
    for kind in [RegulariserKind::SimpleEntropy, RegulariserKind::GullSkilling] {
        let reg = get_regulariser(kind, &prior);
        assert_eq!(reg.clamped_prior_pixels(), 2);
        // A positive image is still evaluated against the clamped prior.
        let image = get_true_image(3, 3, false, 17);
        let eval = reg.evaluate(&image).unwrap();
        assert!(eval.value.is_finite());
        assert_eq!(eval.clamped, 0);
    }
    for kind in [RegulariserKind::Patch, RegulariserKind::L1] {
        assert_eq!(get_regulariser(kind, &prior).clamped_prior_pixels(), 0);
    }
}

#[test]
fn test_patch_and_squared_compactness() {
    let prior = get_true_image(3, 3, false, 18);
    let patch = Regulariser::new(
        RegulariserKind::Patch,
        &prior,
        2.0,
        RegulariserSettings::default(),
    )
    .unwrap();
    assert_abs_diff_eq!(patch.evaluate(&prior).unwrap().value, 0.0);
    // One pixel 1 Jy away: 0.5 * 1^2 / 2^2
    let mut image = prior.clone();
    image.data_mut()[(0, 1, 2)] += 1.0;
    assert_abs_diff_eq!(patch.evaluate(&image).unwrap().value, 0.125, epsilon = 1e-12);

    // A single central pixel is perfectly compact; moving it one pixel
    // away costs I^2 / F^2.
    let mut point = prior.clone();
    point.data_mut().fill(0.0);
    point.data_mut()[(0, 1, 1)] = 2.0;
    let compact = Regulariser::new(
        RegulariserKind::SquaredCompactness,
        &point,
        2.0,
        RegulariserSettings::default(),
    )
    .unwrap();
    assert_abs_diff_eq!(compact.evaluate(&point).unwrap().value, 0.0);
    point.data_mut()[(0, 1, 1)] = 0.0;
    point.data_mut()[(0, 1, 2)] = 2.0;
    assert_abs_diff_eq!(compact.evaluate(&point).unwrap().value, 1.0, epsilon = 1e-12);
    check_gradient(&compact, &point);
}

#[test]
fn test_bad_construction() {
    let image = get_true_image(3, 3, false, 12);
    let result = Regulariser::new(
        RegulariserKind::SimpleEntropy,
        &image,
        0.0,
        RegulariserSettings::default(),
    );
    assert!(matches!(result, Err(ImagerError::InvalidConfig(_))));

    let reg = get_regulariser(RegulariserKind::PolEntropy, &image);
    assert!(matches!(
        reg.evaluate(&image),
        Err(ImagerError::MissingPolarisation {
            stokes: Stokes::Q,
            ..
        })
    ));

    let reg = get_regulariser(RegulariserKind::SimpleEntropy, &image);
    let other = get_true_image(4, 4, false, 13);
    assert!(matches!(
        reg.evaluate(&other),
        Err(ImagerError::ShapeMismatch { .. })
    ));
}
