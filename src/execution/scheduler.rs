//! Scheduling strategy - how many stages of a group may run at once

use serde::{Deserialize, Serialize};

/// Strategy for scheduling stages within one execution group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Execute stages one at a time
    Sequential,

    /// Execute all stages of a group in parallel
    #[default]
    Parallel,

    /// Limited parallelism (max N concurrent stages)
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Number of stages of a group that may run at the same time
    pub fn concurrency_for(&self, group_len: usize) -> usize {
        let limit = match self {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => group_len,
            SchedulingStrategy::LimitedParallel(max) => (*max).min(group_len),
        };
        limit.max(1)
    }

    /// Whether a group of this size runs one stage after another
    pub fn runs_sequentially(&self, group_len: usize) -> bool {
        self.concurrency_for(group_len) == 1
    }
}
