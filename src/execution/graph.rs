//! Execution graph builder - levels stages into dependency-ordered groups

use crate::core::StageDefinition;
use std::collections::HashSet;
use thiserror::Error;

/// Configuration failures detected before a pipeline may start
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Stage '{stage}' depends on non-existent stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Stage '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Dependency cycle detected among stages: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// A batch of mutually independent stages
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionGroup {
    pub index: usize,
    pub stages: Vec<StageDefinition>,
}

impl ExecutionGroup {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }
}

/// Result of leveling a stage list
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionGraph {
    pub groups: Vec<ExecutionGroup>,

    /// Stages that could not be leveled because they sit on (or behind) a cycle.
    /// They are emitted together as the last group.
    pub cycle: Option<Vec<String>>,
}

impl ExecutionGraph {
    pub fn has_cycle(&self) -> bool {
        self.cycle.is_some()
    }

    /// Whether `index` names the last group
    pub fn is_final_group(&self, index: usize) -> bool {
        index + 1 == self.groups.len()
    }

    /// Group index of a stage
    pub fn group_of(&self, stage: &str) -> Option<usize> {
        self.groups
            .iter()
            .find(|g| g.stages.iter().any(|s| s.name == stage))
            .map(|g| g.index)
    }
}

/// Greedily level stages into groups.
///
/// Each pass moves every remaining stage whose dependencies are no longer
/// remaining into the current group. A pass that moves nothing means the
/// remainder contains a cycle; it is emitted as one final group and reported.
/// Dependencies on undeclared names are treated as satisfied here; `validate`
/// reports them.
pub fn build(stages: &[StageDefinition]) -> ExecutionGraph {
    let mut remaining: Vec<&StageDefinition> = stages.iter().collect();
    let mut groups = Vec::new();
    let mut cycle = None;

    while !remaining.is_empty() {
        let pending: HashSet<&str> = remaining.iter().copied().map(|s| s.name.as_str()).collect();

        let (ready, blocked): (Vec<&StageDefinition>, Vec<&StageDefinition>) =
            remaining.into_iter().partition(|stage| {
                stage
                    .depends_on
                    .iter()
                    .all(|dep| !pending.contains(dep.as_str()))
            });

        if ready.is_empty() {
            cycle = Some(blocked.iter().map(|s| s.name.clone()).collect());
            groups.push(ExecutionGroup {
                index: groups.len(),
                stages: blocked.into_iter().cloned().collect(),
            });
            break;
        }

        groups.push(ExecutionGroup {
            index: groups.len(),
            stages: ready.into_iter().cloned().collect(),
        });
        remaining = blocked;
    }

    ExecutionGraph { groups, cycle }
}

/// Check names and dependencies, then level the stages.
///
/// Any configuration failure is returned instead of a graph.
pub fn validate(stages: &[StageDefinition]) -> Result<ExecutionGraph, GraphError> {
    let mut names = HashSet::new();
    for stage in stages {
        if !names.insert(stage.name.as_str()) {
            return Err(GraphError::DuplicateStage(stage.name.clone()));
        }
    }

    for stage in stages {
        for dep in &stage.depends_on {
            if dep == &stage.name {
                return Err(GraphError::SelfDependency(stage.name.clone()));
            }
            if !names.contains(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let graph = build(stages);
    if let Some(cycle) = &graph.cycle {
        return Err(GraphError::Cycle(cycle.clone()));
    }

    Ok(graph)
}
