//! Stage domain model

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Policy applied when a stage fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Halt the pipeline; no further groups run
    #[default]
    Stop,
    /// Record the failure and keep scheduling
    Continue,
    /// Same as continue, but the failure is surfaced as a warning
    Warn,
}

impl FailurePolicy {
    /// Whether this policy halts the pipeline
    pub fn halts(&self) -> bool {
        matches!(self, FailurePolicy::Stop)
    }
}

/// Delay strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Constant delay
    #[default]
    Fixed,
    /// delay * attempt number
    Linear,
    /// delay * 2^attempt
    Exponential,
}

/// Retry configuration for a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,

    /// Base delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Attempts allowed, never less than one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given 0-indexed attempt failed
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let base = self.initial_delay_ms;
        let millis = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(u64::from(failed_attempt) + 1),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(failed_attempt).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

/// A single stage in a pipeline (immutable configuration)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name within the pipeline
    pub name: String,

    /// Stages that must finish before this one may start
    pub depends_on: Vec<String>,

    /// Failure policy for this stage; falls back to the pipeline default
    pub on_fail: Option<FailurePolicy>,

    /// Wall-clock limit for one attempt
    pub timeout_secs: u64,

    pub retry: Option<RetryPolicy>,

    /// Disabled stages are recorded as skipped and never dispatched
    pub enabled: bool,

    /// Opaque inputs handed to the agent
    pub inputs: HashMap<String, String>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            on_fail: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry: None,
            enabled: true,
            inputs: HashMap::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_on_fail(mut self, policy: FailurePolicy) -> Self {
        self.on_fail = Some(policy);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Resolve the effective failure policy
    pub fn effective_policy(&self, default: FailurePolicy) -> FailurePolicy {
        self.on_fail.unwrap_or(default)
    }

    /// Total attempts this stage may make
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, RetryPolicy::attempts)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-attempt timeout when neither the stage nor the pipeline sets one
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
