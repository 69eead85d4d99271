// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pixel-wise regularisers.

use ndarray::{prelude::*, Zip};

/// The relative entropy of `image` with respect to `prior` (already clamped),
/// unnormalised. Below `floor` the entropy continues along its tangent at
/// `floor`, so the value stays finite and agrees with the gradient; the
/// number of pixels at or below the floor is returned with the value. The
/// gradient is written to `grad`.
pub(super) fn entropy(
    image: ArrayView2<f64>,
    prior: ArrayView2<f64>,
    floor: f64,
    gull_skilling: bool,
    mut grad: ArrayViewMut2<f64>,
) -> (f64, usize) {
    let mut terms = Array2::zeros(image.raw_dim());
    Zip::from(&mut terms)
        .and(&mut grad)
        .and(image)
        .and(prior)
        .par_for_each(|term, grad, &i, &p| {
            let at = i.max(floor);
            let log_ratio = (at / p).ln();
            let (value, slope) = if gull_skilling {
                (at * log_ratio - at + p, log_ratio)
            } else {
                (at * log_ratio, log_ratio + 1.0)
            };
            *term = value + slope * (i - at);
            *grad = slope;
        });

    let clamped = image.iter().filter(|&&i| i <= floor).count();
    (terms.sum(), clamped)
}

/// 0.5 sum (I - P)^2, unnormalised.
pub(super) fn patch(
    image: ArrayView2<f64>,
    prior: ArrayView2<f64>,
    mut grad: ArrayViewMut2<f64>,
) -> f64 {
    Zip::from(&mut grad)
        .and(image)
        .and(prior)
        .par_for_each(|grad, &i, &p| *grad = i - p);
    0.5 * grad.iter().map(|d| d * d).sum::<f64>()
}

/// sum sqrt(I^2 + epsilon^2) - epsilon, unnormalised.
pub(super) fn l1(image: ArrayView2<f64>, epsilon: f64, mut grad: ArrayViewMut2<f64>) -> f64 {
    let mut terms = Array2::zeros(image.raw_dim());
    Zip::from(&mut terms)
        .and(&mut grad)
        .and(image)
        .par_for_each(|term, grad, &i| {
            let smoothed = i.hypot(epsilon);
            *term = smoothed - epsilon;
            *grad = i / smoothed;
        });
    terms.sum()
}
