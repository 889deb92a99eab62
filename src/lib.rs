//! stagerun - a dependency-ordered, concurrent stage runner

pub mod agent;
pub mod cli;
pub mod core;
pub mod execution;

// Re-export commonly used types
pub use agent::{AgentError, AgentExecutor, AgentRequest, AgentResponse, CommandAgent, ProgressCallback};
pub use core::{Pipeline, PipelineExecution, PipelineStatus, StageDefinition, StageStatus};
pub use execution::{AbortController, EngineError, ExecutionEngine, ExecutionEvent, SchedulingStrategy};
