use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};
use crate::model::MlpConfig;
use crate::objective::LossKind;
use crate::reverse::VarianceKind;
use crate::schedule::BetaSchedule;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub variance: VarianceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_sample: Option<f64>,
}

/// Everything needed to build a [`crate::Diffusion`] and its reference model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub num_steps: usize,
    /// Per-example shape, batch dimension excluded.
    pub sample_shape: Vec<i64>,
    #[serde(default)]
    pub beta_schedule: BetaSchedule,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub objective: LossKind,
    #[serde(default)]
    pub model: MlpConfig,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_steps: 1000,
            sample_shape: vec![2],
            beta_schedule: BetaSchedule::default(),
            sampler: SamplerConfig::default(),
            objective: LossKind::default(),
            model: MlpConfig::default(),
        }
    }
}

impl DiffusionConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        Self::from_toml_str(&file)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: DiffusionConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Checks that do not need the schedule to be built.
    pub fn validate(&self) -> Result<()> {
        if self.num_steps < 1 {
            return Err(DiffusionError::config("num_steps must be at least 1"));
        }
        if self.sample_shape.is_empty() || self.sample_shape.iter().any(|d| *d < 1) {
            return Err(DiffusionError::config(format!(
                "invalid sample shape {:?}",
                self.sample_shape
            )));
        }
        self.objective.validate()?;
        if let Some(range) = self.sampler.clip_sample {
            if !(range > 0.0) {
                return Err(DiffusionError::config(format!(
                    "clip_sample must be positive, got {range}"
                )));
            }
        }
        Ok(())
    }
}
