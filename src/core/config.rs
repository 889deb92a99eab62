//! Pipeline configuration from YAML

use crate::agent::CommandSpec;
use crate::core::{
    stage::{FailurePolicy, RetryPolicy, StageDefinition, DEFAULT_TIMEOUT_SECS},
    Pipeline,
};
use crate::execution::{graph, SchedulingStrategy};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Global variables available to all stages
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Default failure policy
    #[serde(default)]
    pub on_fail: FailurePolicy,

    /// Default concurrency mode within a group
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Caps parallel stages per group when set
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Default timeout for stages (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Pipeline stages
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyConfig {
    Sequential,
    #[default]
    Parallel,
}

/// Stage configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name
    pub name: String,

    /// Optional stage description
    #[serde(default)]
    pub description: Option<String>,

    /// Shell command run by the command agent
    pub command: String,

    /// Regex the command's stdout must match for the stage to succeed
    #[serde(default)]
    pub success_pattern: Option<String>,

    /// Extra environment for the command
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// List of stage names this stage depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Failure policy for this stage (overrides pipeline default)
    #[serde(default)]
    pub on_fail: Option<FailurePolicy>,

    /// Timeout for this stage (overrides global)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Stage inputs, rendered into the command
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        for stage in &self.stages {
            if stage.command.trim().is_empty() {
                anyhow::bail!("Stage '{}' has an empty command", stage.name);
            }
            if stage.timeout_secs == Some(0) {
                anyhow::bail!("Stage '{}' has a zero timeout", stage.name);
            }
            if let Some(pattern) = &stage.success_pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    anyhow::anyhow!("Stage '{}' has an invalid success_pattern: {}", stage.name, e)
                })?;
            }
        }

        if self.default_timeout_secs == Some(0) {
            anyhow::bail!("default_timeout_secs must be greater than zero");
        }
        if self.max_parallel == Some(0) {
            anyhow::bail!("max_parallel must be greater than zero");
        }

        // Duplicates, unknown dependencies and cycles
        graph::validate(&self.stage_definitions())?;

        Ok(())
    }

    /// Resolved scheduling strategy
    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        match (self.strategy, self.max_parallel) {
            (StrategyConfig::Sequential, _) => SchedulingStrategy::Sequential,
            (StrategyConfig::Parallel, Some(max)) => SchedulingStrategy::LimitedParallel(max),
            (StrategyConfig::Parallel, None) => SchedulingStrategy::Parallel,
        }
    }

    /// Stage definitions with pipeline defaults applied
    pub fn stage_definitions(&self) -> Vec<StageDefinition> {
        let default_timeout = self.default_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);

        self.stages
            .iter()
            .map(|stage| StageDefinition {
                name: stage.name.clone(),
                depends_on: stage.depends_on.clone(),
                on_fail: stage.on_fail,
                timeout_secs: stage.timeout_secs.unwrap_or(default_timeout),
                retry: stage.retry.clone(),
                enabled: stage.enabled,
                inputs: stage.inputs.clone(),
            })
            .collect()
    }

    /// Command agent configuration, keyed by stage name
    pub fn command_specs(&self) -> HashMap<String, CommandSpec> {
        self.stages
            .iter()
            .map(|stage| {
                let spec = CommandSpec {
                    command: stage.command.clone(),
                    success_pattern: stage.success_pattern.clone(),
                    env: stage.env.clone(),
                };
                (stage.name.clone(), spec)
            })
            .collect()
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Pipeline {
        Pipeline {
            name: self.name.clone(),
            variables: self.variables.clone(),
            stages: self.stage_definitions(),
            default_on_fail: self.on_fail,
            strategy: self.scheduling_strategy(),
        }
    }
}
