//! Experiment configuration: the YAML surface handed to the
//! orchestrator by the config loader.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which part of the base scenario a variation dimension rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    /// Swap the model of a named actor.
    ActorModel,
    /// Override a named scenario parameter.
    ScenarioParameter,
}

impl DimensionKind {
    pub fn label(&self) -> &'static str {
        match self {
            DimensionKind::ActorModel => "actor_model",
            DimensionKind::ScenarioParameter => "scenario_parameter",
        }
    }
}

/// One declared variation dimension: the set of values to sweep for a
/// single target, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariationDimension {
    #[serde(rename = "type")]
    pub kind: DimensionKind,
    pub target: String,
    pub values: Vec<serde_json::Value>,
}

impl VariationDimension {
    /// Stable label used as the modification key: `{type}:{target}`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind.label(), self.target)
    }
}

/// Top-level experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    /// Base scenario: a YAML file, or a directory whose
    /// `scenario.yaml` is the entry point.
    pub scenario_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_runs_per_variation")]
    pub runs_per_variation: u32,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub budget_limit: Option<f64>,
    #[serde(default)]
    pub cost_per_run_limit: Option<f64>,
    /// Sequential-mode checkpoint cadence, in completed runs.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    #[serde(default)]
    pub variations: Vec<VariationDimension>,
    /// Command line for the bundled harness executor. First element is
    /// the program, the rest are leading arguments.
    #[serde(default)]
    pub harness_command: Vec<String>,
}

fn default_runs_per_variation() -> u32 {
    1
}

fn default_max_parallel() -> usize {
    1
}

fn default_checkpoint_interval() -> u32 {
    1
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| anyhow!("config_read_failed: {}: {}", path.display(), e))?;
        let config: ExperimentConfig = serde_yaml::from_slice(&bytes)
            .map_err(|e| anyhow!("config_parse_failed: {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("config_invalid: experiment name is empty"));
        }
        if self.runs_per_variation < 1 {
            return Err(anyhow!(
                "config_invalid: runs_per_variation must be >= 1 (got {})",
                self.runs_per_variation
            ));
        }
        if self.max_parallel < 1 {
            return Err(anyhow!(
                "config_invalid: max_parallel must be >= 1 (got {})",
                self.max_parallel
            ));
        }
        if self.checkpoint_interval < 1 {
            return Err(anyhow!(
                "config_invalid: checkpoint_interval must be >= 1 (got {})",
                self.checkpoint_interval
            ));
        }
        if let Some(limit) = self.budget_limit {
            if limit <= 0.0 {
                return Err(anyhow!(
                    "config_invalid: budget_limit must be positive (got {})",
                    limit
                ));
            }
        }
        if let Some(limit) = self.cost_per_run_limit {
            if limit <= 0.0 {
                return Err(anyhow!(
                    "config_invalid: cost_per_run_limit must be positive (got {})",
                    limit
                ));
            }
        }
        for (idx, dim) in self.variations.iter().enumerate() {
            if dim.target.trim().is_empty() {
                return Err(anyhow!(
                    "config_invalid: variation {} has an empty target",
                    idx
                ));
            }
            if dim.values.is_empty() {
                return Err(anyhow!(
                    "config_invalid: variation '{}' declares no values",
                    dim.label()
                ));
            }
        }
        Ok(())
    }

    /// True when the batch runs strictly in declared order.
    pub fn sequential(&self) -> bool {
        self.max_parallel == 1
    }
}
