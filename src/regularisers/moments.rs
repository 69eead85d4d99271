// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Regularisers on the moments of the flux distribution. Positions are
//! measured in pixels.

use ndarray::prelude::*;

/// ((sum I - flux) / flux)^2
pub(super) fn flux(image: ArrayView2<f64>, flux: f64, mut grad: ArrayViewMut2<f64>) -> f64 {
    let excess = image.sum() - flux;
    grad.fill(2.0 * excess / (flux * flux));
    (excess / flux).powi(2)
}

/// The zeroth and first moments of `image`: (sum I, mean x, mean y), with x
/// and y the column and row indices. `None` if there is no flux.
fn first_moments(image: ArrayView2<f64>) -> Option<(f64, f64, f64)> {
    let (m0, mx, my) = image
        .indexed_iter()
        .fold((0.0, 0.0, 0.0), |(m0, mx, my), ((iy, ix), &i)| {
            (m0 + i, mx + i * ix as f64, my + i * iy as f64)
        });
    (m0.abs() >= f64::MIN_POSITIVE).then(|| (m0, mx / m0, my / m0))
}

/// The squared distance between the centroid and the centre pixel
/// \[pixels^2\].
pub(super) fn centroid(image: ArrayView2<f64>, mut grad: ArrayViewMut2<f64>) -> f64 {
    let Some((m0, cx, cy)) = first_moments(image) else {
        return 0.0;
    };
    let (ny, nx) = image.dim();
    let (dx, dy) = (cx - (nx / 2) as f64, cy - (ny / 2) as f64);
    for ((iy, ix), g) in grad.indexed_iter_mut() {
        *g = 2.0 * (dx * (ix as f64 - cx) + dy * (iy as f64 - cy)) / m0;
    }
    dx * dx + dy * dy
}

/// The flux-weighted variance of pixel positions about the centroid
/// \[pixels^2\]. Zero for a single bright pixel.
pub(super) fn compactness(image: ArrayView2<f64>, mut grad: ArrayViewMut2<f64>) -> f64 {
    let Some((m0, cx, cy)) = first_moments(image) else {
        return 0.0;
    };
    let r2 = |iy: usize, ix: usize| (ix as f64 - cx).powi(2) + (iy as f64 - cy).powi(2);
    let value = image
        .indexed_iter()
        .map(|((iy, ix), &i)| i * r2(iy, ix))
        .sum::<f64>()
        / m0;
    for ((iy, ix), g) in grad.indexed_iter_mut() {
        *g = (r2(iy, ix) - value) / m0;
    }
    value
}

/// sum I^2 r^2 / flux^2, with r the distance from the centre pixel
/// \[pixels^2\]. Unlike [`compactness`], this is convex and doesn't depend
/// on the centroid.
pub(super) fn squared_compactness(
    image: ArrayView2<f64>,
    flux: f64,
    mut grad: ArrayViewMut2<f64>,
) -> f64 {
    let (ny, nx) = image.dim();
    let (cx, cy) = ((nx / 2) as f64, (ny / 2) as f64);
    let norm = flux * flux;
    let mut value = 0.0;
    for (((iy, ix), &i), g) in image.indexed_iter().zip(grad.iter_mut()) {
        let r2 = (ix as f64 - cx).powi(2) + (iy as f64 - cy).powi(2);
        value += i * i * r2;
        *g = 2.0 * i * r2 / norm;
    }
    value / norm
}
