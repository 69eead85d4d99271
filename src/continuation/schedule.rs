// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Imaging plans: the global configuration and the stages to run.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    str::FromStr,
};

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;
use vec1::Vec1;

use crate::{
    constants::DEFAULT_RETRY_STEP_SCALE,
    data_terms::{AmpDebias, DataTermKind, DataTermSettings},
    model::Pulse,
    objective::Transform,
    observation::ClosureSelection,
    optimiser::OptimiserConfig,
    regularisers::{RegulariserKind, RegulariserSettings},
    ImagerError,
};

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightedDataTerm {
    pub kind: DataTermKind,
    #[serde(default = "one")]
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightedRegulariser {
    pub kind: RegulariserKind,
    #[serde(default = "one")]
    pub weight: f64,
}

/// One optimiser run of a reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub data_terms: Vec1<WeightedDataTerm>,

    #[serde(default)]
    pub regularisers: Vec<WeightedRegulariser>,

    /// The total flux \[Jy\]. If given, the seed image and prior are rescaled
    /// to it; otherwise the prior's flux is used as the reference flux of
    /// the regularisers.
    #[serde(default)]
    pub flux: Option<f64>,

    /// Only pixels where the prior exceeds this \[Jy/pixel\] are imaged. If
    /// not given, all pixels are.
    #[serde(default)]
    pub clip_floor: Option<f64>,

    #[serde(default)]
    pub transform: Transform,

    /// Closure-based data terms are only used when this is set.
    #[serde(default = "yes")]
    pub active_closure_terms: bool,

    /// Overrides the optimiser's `ftol`.
    #[serde(default)]
    pub tolerance: Option<f64>,

    /// Overrides the optimiser's maximum number of iterations.
    #[serde(default)]
    pub max_iterations: Option<u32>,

    /// The seed image is blurred with a circular Gaussian of this FWHM
    /// \[micro-arcseconds\] before the stage starts.
    #[serde(default)]
    pub blur_fwhm_uas: Option<f64>,
}

impl StageConfig {
    /// The data terms this stage actually uses.
    pub fn active_data_terms(&self) -> impl Iterator<Item = &WeightedDataTerm> {
        self.data_terms
            .iter()
            .filter(|t| self.active_closure_terms || !t.kind.uses_closures())
    }

    fn validate(&self, stage: usize) -> Result<(), ImagerError> {
        let invalid = |msg: String| Err(ImagerError::InvalidConfig(format!("Stage {stage}: {msg}")));
        if self.active_data_terms().next().is_none() {
            return invalid("no data terms are active".to_string());
        }
        if let Some(flux) = self.flux {
            if !(flux.is_finite() && flux > 0.0) {
                return invalid(format!("the flux must be positive, got {flux}"));
            }
        }
        if let Some(floor) = self.clip_floor {
            if !floor.is_finite() {
                return invalid(format!("the clip floor must be finite, got {floor}"));
            }
        }
        if let Some(tol) = self.tolerance {
            if !(tol >= 0.0) {
                return invalid(format!("the tolerance must not be negative, got {tol}"));
            }
        }
        if let Some(fwhm) = self.blur_fwhm_uas {
            if !(fwhm >= 0.0 && fwhm.is_finite()) {
                return invalid(format!("the blurring FWHM must not be negative, got {fwhm}"));
            }
        }
        Ok(())
    }
}

/// The stages of a reconstruction, in the order they run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationSchedule {
    pub stages: Vec<StageConfig>,
}

impl ContinuationSchedule {
    pub fn validate(&self) -> Result<(), ImagerError> {
        self.stages
            .iter()
            .enumerate()
            .try_for_each(|(i, stage)| stage.validate(i + 1))
    }
}

/// What to do when a stage's line search fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailurePolicy {
    /// Run the stage once more from the same seed with a smaller maximum step
    /// and a larger shrink budget.
    #[default]
    RetryRelaxed,

    /// Move on to the next stage.
    Skip,
}

/// Settings that apply to every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagerConfig {
    pub optimiser: OptimiserConfig,

    /// Stop after any stage in which every active data term has a
    /// chi-squared at or below this.
    pub chi_squared_target: Option<f64>,

    pub stage_failure: StageFailurePolicy,

    /// A retried stage's maximum step is multiplied by this.
    pub retry_step_scale: f64,

    pub closure_selection: ClosureSelection,

    pub amp_debias: AmpDebias,

    /// Closure amplitudes with a signal-to-noise ratio below this are not
    /// used.
    pub closure_snr_cut: f64,

    /// A fraction of each visibility's amplitude added in quadrature to its
    /// noise.
    pub systematic_noise: f64,

    pub pulse: Pulse,

    pub regularisers: RegulariserSettings,
}

impl Default for ImagerConfig {
    fn default() -> Self {
        ImagerConfig {
            optimiser: OptimiserConfig::default(),
            chi_squared_target: None,
            stage_failure: StageFailurePolicy::default(),
            retry_step_scale: DEFAULT_RETRY_STEP_SCALE,
            closure_selection: ClosureSelection::default(),
            amp_debias: AmpDebias::default(),
            closure_snr_cut: 0.0,
            systematic_noise: 0.0,
            pulse: Pulse::default(),
            regularisers: RegulariserSettings::default(),
        }
    }
}

impl ImagerConfig {
    pub fn validate(&self) -> Result<(), ImagerError> {
        self.optimiser.validate()?;
        if !(self.retry_step_scale > 0.0 && self.retry_step_scale.is_finite()) {
            return Err(ImagerError::InvalidConfig(format!(
                "The retry step scale must be positive, got {}",
                self.retry_step_scale
            )));
        }
        if let Some(target) = self.chi_squared_target {
            if !(target > 0.0) {
                return Err(ImagerError::InvalidConfig(format!(
                    "The chi-squared target must be positive, got {target}"
                )));
            }
        }
        Ok(())
    }

    pub fn data_term_settings(&self) -> DataTermSettings {
        DataTermSettings {
            amp_debias: self.amp_debias,
            closure_snr_cut: self.closure_snr_cut,
        }
    }
}

#[derive(Debug, Display, EnumIter, EnumString)]
enum PlanFileType {
    #[strum(serialize = "toml")]
    Toml,
    #[strum(serialize = "json")]
    Json,
    #[strum(serialize = "yaml", serialize = "yml")]
    Yaml,
}

#[derive(Error, Debug)]
pub enum ScheduleReadError {
    #[error("Couldn't decode toml structure from {file}:\n{err}")]
    Toml { file: PathBuf, err: String },

    #[error("Couldn't decode json structure from {file}:\n{err}")]
    Json { file: PathBuf, err: String },

    #[error("Couldn't decode yaml structure from {file}:\n{err}")]
    Yaml { file: PathBuf, err: String },

    #[error("Imaging plan {file} doesn't have a recognised file extension (one of: {supported})")]
    UnrecognisedExtension { file: PathBuf, supported: String },

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Everything needed to reconstruct an image besides the data and the prior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImagingPlan {
    #[serde(default)]
    pub config: ImagerConfig,
    pub stages: ContinuationSchedule,
}

impl ImagingPlan {
    /// Read a plan from a toml, json or yaml file. The format is determined
    /// by the file's extension. The plan is validated.
    pub fn read<P: AsRef<Path>>(file: P) -> Result<ImagingPlan, ImagerError> {
        fn inner(file: &Path) -> Result<ImagingPlan, ScheduleReadError> {
            let file_type = file
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .and_then(|e| PlanFileType::from_str(&e).ok());
            let Some(file_type) = file_type else {
                return Err(ScheduleReadError::UnrecognisedExtension {
                    file: file.to_path_buf(),
                    supported: PlanFileType::iter().join(", "),
                });
            };

            debug!("Parsing {file_type} imaging plan {}", file.display());
            let mut contents = String::new();
            File::open(file)?.read_to_string(&mut contents)?;
            let plan = match file_type {
                PlanFileType::Toml => {
                    toml::from_str(&contents).map_err(|e| ScheduleReadError::Toml {
                        file: file.to_path_buf(),
                        err: e.to_string(),
                    })?
                }
                PlanFileType::Json => {
                    serde_json::from_str(&contents).map_err(|e| ScheduleReadError::Json {
                        file: file.to_path_buf(),
                        err: e.to_string(),
                    })?
                }
                PlanFileType::Yaml => {
                    serde_yaml::from_str(&contents).map_err(|e| ScheduleReadError::Yaml {
                        file: file.to_path_buf(),
                        err: e.to_string(),
                    })?
                }
            };
            Ok(plan)
        }

        let plan = inner(file.as_ref())?;
        plan.config.validate()?;
        plan.stages.validate()?;
        Ok(plan)
    }
}
