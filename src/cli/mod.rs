// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code.
//!
//! Reconstruction itself is driven from the library; the binary only checks
//! imaging plans so they can be fixed before a long run.

mod printers;
#[cfg(test)]
mod tests;

use std::{borrow::Cow, path::PathBuf};

use clap::{AppSettings, Args, Parser, Subcommand};
use log::info;

use crate::{
    continuation::{ImagingPlan, StageConfig},
    optimiser::Direction,
    ImagerError, PROGRESS_BARS,
};
use printers::InfoPrinter;

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    about = "Maximum-entropy image reconstruction for very-long-baseline interferometry"
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
pub struct VlbiImager {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Don't draw progress bars.
    #[clap(long)]
    #[clap(global = true)]
    no_progress_bars: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(alias = "verify-schedule")]
    #[clap(about = "Read an imaging plan (toml, json or yaml) and print what it would do.")]
    ScheduleVerify(ScheduleVerifyArgs),
}

#[derive(Debug, Args)]
struct ScheduleVerifyArgs {
    /// The imaging plan to check.
    #[clap(name = "PLAN_FILE", parse(from_os_str))]
    plan: PathBuf,
}

impl VlbiImager {
    pub fn run(self) -> Result<(), ImagerError> {
        let GlobalArgs {
            no_progress_bars,
            verbosity,
        } = self.global_opts;
        if let Err(e) = setup_logging(verbosity) {
            eprintln!("Failed to initialise logging: {e}");
        }
        if !no_progress_bars {
            PROGRESS_BARS.store(true);
        }

        let sub_command = match &self.command {
            Command::ScheduleVerify(_) => "schedule-verify",
        };
        info!("vlbi-imager {} {}", sub_command, env!("CARGO_PKG_VERSION"));
        display_build_info();

        match self.command {
            Command::ScheduleVerify(ScheduleVerifyArgs { plan }) => {
                let parsed = ImagingPlan::read(&plan)?;
                for printer in describe_plan(&parsed) {
                    printer.display();
                }
                info!("{} is valid", plan.display());
            }
        }

        info!("vlbi-imager {} complete.", sub_command);
        Ok(())
    }
}

/// Activate a logger. All log messages are put onto `stdout`. `env_logger`
/// automatically only uses colours and fancy symbols if we're on a tty (e.g. a
/// terminal); piped output will be formatted sensibly. Source code lines are
/// displayed in log messages when verbosity >= 3.
pub fn setup_logging(verbosity: u8) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.try_init()
}

/// Write many info-level log lines of how this executable was compiled.
fn display_build_info() {
    info!("Compiled {}", BUILT_TIME_UTC);
    info!("    with compiler {}", RUSTC_VERSION);
    info!("    for {} ({})", TARGET, PROFILE);
    info!("");
}

fn describe_plan(plan: &ImagingPlan) -> Vec<InfoPrinter> {
    let config = &plan.config;
    let opt = &config.optimiser;

    let mut global = InfoPrinter::new("Imaging configuration".into());
    let direction = match opt.direction {
        Direction::ConjugateGradient => "conjugate gradients".to_string(),
        Direction::Lbfgs { memory } => format!("L-BFGS (memory {memory})"),
    };
    global.push_block(vec![
        format!("Optimiser: {direction}").into(),
        format!(
            "ftol {:e}, gtol {:e}, {} consecutive, {} iterations max",
            opt.ftol, opt.gtol, opt.consecutive, opt.max_iterations
        )
        .into(),
        format!(
            "Line search: Armijo {:e}, shrink {} up to {} times, max step {}",
            opt.armijo_c1, opt.shrink_factor, opt.max_shrinks, opt.max_step
        )
        .into(),
    ]);
    global.push_line(match config.chi_squared_target {
        Some(t) => format!("Stop when every chi-squared is at or below {t}").into(),
        None => "Run every stage".into(),
    });
    global.push_line(
        format!(
            "Failed stages: {} (retry step scale {})",
            config.stage_failure, config.retry_step_scale
        )
        .into(),
    );
    global.push_block(vec![
        format!("Closures: {:?}", config.closure_selection).into(),
        format!(
            "Amplitude debiasing: {:?}, closure SNR cut {}",
            config.amp_debias, config.closure_snr_cut
        )
        .into(),
        format!("Systematic noise: {}", config.systematic_noise).into(),
        format!("Pixel response: {:?}", config.pulse).into(),
    ]);

    let mut printers = vec![global];
    let num_stages = plan.stages.stages.len();
    if num_stages == 0 {
        let mut empty = InfoPrinter::new("Stages".into());
        empty.push_line("None; the prior will be returned unchanged".into());
        printers.push(empty);
    }
    for (i, stage) in plan.stages.stages.iter().enumerate() {
        printers.push(describe_stage(i + 1, num_stages, stage));
    }
    printers
}

fn describe_stage(stage_num: usize, num_stages: usize, stage: &StageConfig) -> InfoPrinter {
    let mut printer = InfoPrinter::new(format!("Stage {stage_num}/{num_stages}").into());
    printer.push_block(
        stage
            .data_terms
            .iter()
            .map(|t| {
                let inactive = if stage.active_closure_terms || !t.kind.uses_closures() {
                    ""
                } else {
                    " (inactive)"
                };
                Cow::from(format!("Data term {} x {}{inactive}", t.kind, t.weight))
            })
            .collect(),
    );
    if stage.regularisers.is_empty() {
        printer.push_line("No regularisers".into());
    } else {
        printer.push_block(
            stage
                .regularisers
                .iter()
                .map(|r| Cow::from(format!("Regulariser {} x {}", r.kind, r.weight)))
                .collect(),
        );
    }

    let mut seed: Vec<Cow<'static, str>> = vec![format!("Transform: {}", stage.transform).into()];
    if let Some(flux) = stage.flux {
        seed.push(format!("Total flux: {flux} Jy").into());
    }
    if let Some(floor) = stage.clip_floor {
        seed.push(format!("Pixels below {floor} Jy in the prior are fixed at zero").into());
    }
    if let Some(fwhm) = stage.blur_fwhm_uas {
        seed.push(format!("Seed blurred by {fwhm} uas").into());
    }
    printer.push_block(seed);

    match (stage.tolerance, stage.max_iterations) {
        (None, None) => (),
        (tol, max) => printer.push_line(
            format!(
                "Tolerance {}, at most {} iterations",
                tol.map_or("default".to_string(), |t| format!("{t:e}")),
                max.map_or("default".to_string(), |m| m.to_string())
            )
            .into(),
        ),
    }
    printer
}
