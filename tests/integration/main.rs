// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Integration tests.
//!
//! Some help for laying out these tests was taken from:
//! https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod plans;
mod reconstruction;

use std::f64::consts::{LN_2, TAU};

use hifitime::Epoch;
use ndarray::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use vlbi_imager::{
    c64,
    constants::UAS_TO_RAD,
    image::RADec,
    model::{ForwardModel, Pulse},
    observation::PolVisibility,
    Image, ImageGeometry, Observation, Stokes, Visibility,
};

/// Station names and their positions projected onto the sky plane
/// \[wavelengths\].
const STATIONS: [(&str, f64, f64); 6] = [
    ("ALMA", 0.0, 0.0),
    ("APEX", 0.3e9, 0.8e9),
    ("JCMT", -2.1e9, 1.4e9),
    ("LMT", 1.2e9, -0.6e9),
    ("SMT", -0.9e9, -1.7e9),
    ("SPT", 2.4e9, 2.2e9),
];

fn get_geometry(n: usize, pixel_size_uas: f64) -> ImageGeometry {
    ImageGeometry {
        nx: n,
        ny: n,
        pixel_size: pixel_size_uas * UAS_TO_RAD,
        phase_centre: RADec::from_degrees(187.7059, 12.3911),
        freq_hz: 230e9,
        source: "M87".to_string(),
        mjd: 57854.0,
    }
}

/// A circular Gaussian with `flux` \[Jy\] and a FWHM of `fwhm_uas`, centred
/// `offset` pixels (x, y) from the image centre.
fn gaussian_image(
    geometry: ImageGeometry,
    flux: f64,
    fwhm_uas: f64,
    offset: (f64, f64),
) -> Image {
    let sigma_px = fwhm_uas * UAS_TO_RAD / geometry.pixel_size / (2.0 * (2.0 * LN_2).sqrt());
    let (cx, cy) = (
        (geometry.nx / 2) as f64 + offset.0,
        (geometry.ny / 2) as f64 + offset.1,
    );
    let plane = Array2::from_shape_fn((geometry.ny, geometry.nx), |(iy, ix)| {
        let r2 = (ix as f64 - cx).powi(2) + (iy as f64 - cy).powi(2);
        (-0.5 * r2 / (sigma_px * sigma_px)).exp()
    });
    Image::new(geometry, plane).unwrap().with_total_flux(flux)
}

fn gaussian_noise(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Observe `image` on every baseline at `num_times` times, rotating the array
/// between times. Every measurement has `sigma` noise, which is actually
/// added with a seeded generator.
fn observe(image: &Image, num_times: usize, sigma: f64, seed: u64) -> Observation {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut visibilities = vec![];
    for i_time in 0..num_times {
        let time = Epoch::from_gpst_seconds(1e9 + 300.0 * i_time as f64);
        let (s, c) = (0.1 * i_time as f64).sin_cos();
        for (i1, (n1, x1, y1)) in STATIONS.iter().enumerate() {
            for (n2, x2, y2) in &STATIONS[i1 + 1..] {
                let (dx, dy) = (x2 - x1, y2 - y1);
                visibilities.push(Visibility {
                    time,
                    station1: n1.to_string(),
                    station2: n2.to_string(),
                    u: c * dx - s * dy,
                    v: s * dx + c * dy,
                    vis: c64::default(),
                    sigma,
                    pol: None,
                });
            }
        }
    }

    let uvs: Vec<(f64, f64)> = visibilities.iter().map(|v| (v.u, v.v)).collect();
    let model = ForwardModel::new(image.geometry(), &uvs, Pulse::Triangle);
    let predict = |stokes| image.stokes(stokes).map(|plane| model.forward(plane));
    let i = predict(Stokes::I).unwrap();
    let q = predict(Stokes::Q);
    let u = predict(Stokes::U);
    let v = predict(Stokes::V);
    let mut noise = || c64::new(gaussian_noise(&mut rng), gaussian_noise(&mut rng)) * sigma;
    for (k, vis) in visibilities.iter_mut().enumerate() {
        vis.vis = i[k] + noise();
        if let (Some(q), Some(u), Some(v)) = (&q, &u, &v) {
            vis.pol = Some(PolVisibility {
                q: q[k] + noise(),
                u: u[k] + noise(),
                v: v[k] + noise(),
                sigma_q: sigma,
                sigma_u: sigma,
                sigma_v: sigma,
            });
        }
    }

    Observation {
        source: "M87".to_string(),
        freq_hz: 230e9,
        phase_centre: image.geometry().phase_centre,
        visibilities,
    }
}
