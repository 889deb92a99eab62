//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Number of progress notices kept per stage
pub const TOOL_ACTIVITY_CAPACITY: usize = 3;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Pipeline is currently running
    Running,
    /// Every dispatched stage succeeded or was skipped
    Completed,
    /// A stop policy (or an abort) halted the pipeline
    Failed,
    /// At least one stage failed under continue/warn
    Partial,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineStatus::Running)
    }
}

/// Status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Check if stage is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Failed | StageStatus::Skipped)
    }
}

/// Category of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageErrorKind {
    /// The agent reported an unsuccessful result
    Failure,
    /// An attempt exceeded its timeout
    Timeout,
    /// The pipeline was aborted
    Cancelled,
}

/// Error carried by a failed stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
    pub suggestion: Option<String>,
}

impl StageError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Failure,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self {
            kind: StageErrorKind::Timeout,
            message: format!("Timeout after {} seconds", timeout_secs),
            suggestion: Some("increase timeout_secs for this stage".to_string()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: StageErrorKind::Cancelled,
            message: "Pipeline was aborted".to_string(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == StageErrorKind::Cancelled
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

/// Runtime record of one stage across all of its attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage_name: String,
    pub status: StageStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end
    pub duration_ms: Option<u64>,
    /// 0-indexed current attempt
    pub retry_attempt: u32,
    pub max_retries: u32,
    /// Present only when status is failed
    pub error: Option<StageError>,
    /// Reason recorded when the stage was skipped
    pub skip_reason: Option<String>,
    pub output: Option<String>,
    pub structured_data: Option<serde_json::Value>,
    /// Most recent progress notices, oldest first
    pub tool_activity: VecDeque<String>,
}

impl StageExecution {
    pub fn pending(stage_name: impl Into<String>, max_retries: u32) -> Self {
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            retry_attempt: 0,
            max_retries,
            error: None,
            skip_reason: None,
            output: None,
            structured_data: None,
            tool_activity: VecDeque::with_capacity(TOOL_ACTIVITY_CAPACITY),
        }
    }

    /// Enter the running state for the given attempt
    pub fn start_attempt(&mut self, attempt: u32, at: DateTime<Utc>) {
        self.status = StageStatus::Running;
        self.retry_attempt = attempt;
        self.error = None;
        self.end_time = None;
        self.duration_ms = None;
        if self.start_time.is_none() {
            self.start_time = Some(at);
        }
    }

    /// Append a progress notice, dropping the oldest past capacity
    pub fn push_activity(&mut self, text: impl Into<String>) {
        if self.tool_activity.len() == TOOL_ACTIVITY_CAPACITY {
            self.tool_activity.pop_front();
        }
        self.tool_activity.push_back(text.into());
    }

    pub fn succeed(
        &mut self,
        output: String,
        structured_data: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) {
        self.status = StageStatus::Success;
        self.output = Some(output);
        self.structured_data = structured_data;
        self.error = None;
        self.finish(at);
    }

    pub fn fail(&mut self, error: StageError, at: DateTime<Utc>) {
        self.status = StageStatus::Failed;
        self.error = Some(error);
        self.finish(at);
    }

    pub fn skip(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        self.status = StageStatus::Skipped;
        self.skip_reason = Some(reason.into());
        self.end_time = Some(at);
    }

    fn finish(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
        let started = self.start_time.unwrap_or(at);
        self.duration_ms = Some((at - started).num_milliseconds().max(0) as u64);
    }
}

/// Aggregate state of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Unique execution ID
    pub execution_id: Uuid,
    pub pipeline_name: String,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// One record per declared stage, in declaration order
    pub stages: Vec<StageExecution>,
}

impl PipelineExecution {
    pub fn new(pipeline_name: impl Into<String>, stages: Vec<StageExecution>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            status: PipelineStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            stages,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.stage_name == name)
    }

    /// Record that some stage failed under a non-halting policy
    pub fn mark_partial(&mut self) {
        if self.status == PipelineStatus::Running {
            self.status = PipelineStatus::Partial;
        }
    }

    /// Move to a terminal status
    pub fn finish(&mut self, status: PipelineStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    /// Calculate progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.stages.is_empty() {
            return 1.0;
        }
        let done = self.stages.iter().filter(|s| s.status.is_terminal()).count();
        done as f64 / self.stages.len() as f64
    }
}
