//! Pipeline domain model

use crate::core::stage::{FailurePolicy, StageDefinition};
use crate::execution::SchedulingStrategy;
use std::collections::HashMap;

/// A pipeline definition: stages plus pipeline-wide defaults
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Global variables available to all stages
    pub variables: HashMap<String, String>,

    /// Stages in declaration order
    pub stages: Vec<StageDefinition>,

    /// Failure policy for stages that do not set their own
    pub default_on_fail: FailurePolicy,

    /// Concurrency mode within a group
    pub strategy: SchedulingStrategy,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            variables: HashMap::new(),
            stages,
            default_on_fail: FailurePolicy::Stop,
            strategy: SchedulingStrategy::Parallel,
        }
    }

    pub fn with_default_on_fail(mut self, policy: FailurePolicy) -> Self {
        self.default_on_fail = policy;
        self
    }

    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Get a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}
