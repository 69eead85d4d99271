// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Imaging plans read from files.

use std::io::Write;

use vlbi_imager::{
    continuation::StageFailurePolicy, data_terms::DataTermKind, optimiser::Direction, reconstruct,
    ImagingPlan,
};

use super::*;

const PLAN: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/test_files/two_stage_plan.toml");

#[test]
fn test_plan_file_is_read() {
    let plan = ImagingPlan::read(PLAN).unwrap();
    assert_eq!(plan.config.chi_squared_target, Some(1.0));
    assert_eq!(plan.config.stage_failure, StageFailurePolicy::RetryRelaxed);
    assert_eq!(
        plan.config.optimiser.direction,
        Direction::Lbfgs { memory: 20 }
    );
    assert_eq!(plan.stages.stages.len(), 2);
    assert_eq!(
        plan.stages.stages[0]
            .data_terms
            .iter()
            .map(|t| t.kind)
            .collect::<Vec<_>>(),
        vec![DataTermKind::Amp, DataTermKind::ClosurePhase]
    );
    assert_eq!(plan.stages.stages[1].tolerance, Some(1e-8));

    // The same plan in another format reads back identically.
    let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    yaml.write_all(serde_yaml::to_string(&plan).unwrap().as_bytes())
        .unwrap();
    yaml.flush().unwrap();
    assert_eq!(ImagingPlan::read(yaml.path()).unwrap(), plan);
}

#[test]
fn test_plan_file_is_run() {
    let plan = ImagingPlan::read(PLAN).unwrap();
    let truth = gaussian_image(get_geometry(12, 10.0), 1.0, 30.0, (-1.0, 0.5));
    let obs = observe(&truth, 6, 0.02, 300);
    let prior = gaussian_image(get_geometry(12, 10.0), 1.0, 50.0, (0.0, 0.0));

    let result = reconstruct(&obs, &prior, &plan.stages, &plan.config).unwrap();
    assert!(!result.stages.is_empty());
    assert!(result.stages.len() <= 2);
    if result.stages.len() == 1 {
        assert!(result.target_reached);
    }
    for (i, report) in result.stages.iter().enumerate() {
        assert_eq!(report.stage, i + 1);
        assert!(report.iterations <= 40);
    }
    assert_eq!(result.status, result.stages.last().map(|s| s.status));
    assert_eq!(result.image.dim(), prior.dim());
}
