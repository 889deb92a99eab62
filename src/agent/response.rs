//! Agent request and response types

use crate::core::StageContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No agent configuration for stage '{0}'")]
    UnknownStage(String),

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// What the engine asks an agent to do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub stage_name: String,

    /// 0-indexed attempt number
    pub attempt: u32,

    pub context: StageContext,
}

/// Response from the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Whether the agent considers the stage done
    pub success: bool,

    /// The response content
    pub output: String,

    /// Parsed output, when the agent produced any
    pub structured_data: Option<serde_json::Value>,

    /// Failure description when `success` is false
    pub error: Option<String>,
}

impl AgentResponse {
    /// Create a successful response
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            structured_data: None,
            error: None,
        }
    }

    /// Create an unsuccessful response
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            structured_data: None,
            error: Some(error.into()),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_structured_data(mut self, data: serde_json::Value) -> Self {
        self.structured_data = Some(data);
        self
    }
}
