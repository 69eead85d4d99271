// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Penalties on differences between neighbouring pixels.
//!
//! Differences are taken forwards along each axis. The last row and column
//! have no forward neighbour; their differences are zero (the image is not
//! treated as periodic).

use ndarray::prelude::*;

/// The forward differences (dx, dy) at pixel (iy, ix).
fn differences(image: ArrayView2<f64>, iy: usize, ix: usize) -> (f64, f64) {
    let (ny, nx) = image.dim();
    let here = image[(iy, ix)];
    let dx = if ix + 1 < nx {
        image[(iy, ix + 1)] - here
    } else {
        0.0
    };
    let dy = if iy + 1 < ny {
        image[(iy + 1, ix)] - here
    } else {
        0.0
    };
    (dx, dy)
}

/// sum sqrt(dx^2 + dy^2 + epsilon^2) - epsilon, unnormalised.
pub(super) fn total_variation(
    image: ArrayView2<f64>,
    epsilon: f64,
    mut grad: ArrayViewMut2<f64>,
) -> f64 {
    let (ny, nx) = image.dim();
    let mut value = 0.0;
    for iy in 0..ny {
        for ix in 0..nx {
            let (dx, dy) = differences(image, iy, ix);
            let magnitude = (dx * dx + dy * dy + epsilon * epsilon).sqrt();
            value += magnitude - epsilon;

            grad[(iy, ix)] -= (dx + dy) / magnitude;
            if ix + 1 < nx {
                grad[(iy, ix + 1)] += dx / magnitude;
            }
            if iy + 1 < ny {
                grad[(iy + 1, ix)] += dy / magnitude;
            }
        }
    }
    value
}

/// sum dx^2 + dy^2, unnormalised.
pub(super) fn total_squared_variation(
    image: ArrayView2<f64>,
    mut grad: ArrayViewMut2<f64>,
) -> f64 {
    let (ny, nx) = image.dim();
    let mut value = 0.0;
    for iy in 0..ny {
        for ix in 0..nx {
            let (dx, dy) = differences(image, iy, ix);
            value += dx * dx + dy * dy;

            grad[(iy, ix)] -= 2.0 * (dx + dy);
            if ix + 1 < nx {
                grad[(iy, ix + 1)] += 2.0 * dx;
            }
            if iy + 1 < ny {
                grad[(iy + 1, ix)] += 2.0 * dy;
            }
        }
    }
    value
}
