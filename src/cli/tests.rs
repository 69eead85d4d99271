// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use vec1::vec1;

use super::*;
use crate::{
    continuation::{ContinuationSchedule, WeightedDataTerm, WeightedRegulariser},
    data_terms::DataTermKind,
    regularisers::RegulariserKind,
};

#[test]
fn test_args_are_parsed() {
    let args = VlbiImager::try_parse_from(["vlbi-imager", "-vv", "schedule-verify", "plan.toml"])
        .unwrap();
    assert_eq!(args.global_opts.verbosity, 2);
    assert!(!args.global_opts.no_progress_bars);
    match args.command {
        Command::ScheduleVerify(ScheduleVerifyArgs { plan }) => {
            assert_eq!(plan, PathBuf::from("plan.toml"))
        }
    }

    // Global args can come after the subcommand, and subcommands can be
    // abbreviated.
    let args =
        VlbiImager::try_parse_from(["vlbi-imager", "schedule", "plan.yaml", "--no-progress-bars"])
            .unwrap();
    assert!(args.global_opts.no_progress_bars);

    assert!(VlbiImager::try_parse_from(["vlbi-imager", "schedule-verify"]).is_err());
}

#[test]
fn test_plans_are_described() {
    let empty = ImagingPlan::default();
    let printers = describe_plan(&empty);
    assert_eq!(printers.len(), 2);
    assert_eq!(printers[1].lines().len(), 1);
    assert!(printers[1].lines()[0].starts_with('└'));

    let stage = StageConfig {
        data_terms: vec1![
            WeightedDataTerm {
                kind: DataTermKind::Amp,
                weight: 1.0,
            },
            WeightedDataTerm {
                kind: DataTermKind::ClosurePhase,
                weight: 2.0,
            }
        ],
        regularisers: vec![WeightedRegulariser {
            kind: RegulariserKind::TotalVariation,
            weight: 0.1,
        }],
        flux: Some(0.6),
        clip_floor: None,
        transform: Default::default(),
        active_closure_terms: false,
        tolerance: None,
        max_iterations: Some(10),
        blur_fwhm_uas: None,
    };
    let plan = ImagingPlan {
        config: Default::default(),
        stages: ContinuationSchedule {
            stages: vec![stage.clone(), stage],
        },
    };
    let printers = describe_plan(&plan);
    assert_eq!(printers.len(), 3);
    assert_eq!(printers[2].title, "Stage 2/2");

    let lines = printers[1].lines();
    assert_eq!(
        lines,
        vec![
            "├ Data term amp x 1",
            "│ Data term closure_phase x 2 (inactive)",
            "├ Regulariser total_variation x 0.1",
            "├ Transform: log",
            "│ Total flux: 0.6 Jy",
            "└ Tolerance default, at most 10 iterations",
        ]
    );
}
