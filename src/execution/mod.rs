//! Pipeline execution engine

pub mod abort;
pub mod engine;
pub mod graph;
pub mod runner;
pub mod scheduler;

pub use abort::{AbortController, Aborted, ProcessHandle, ProcessId, TerminationSignal, DEFAULT_GRACE_PERIOD};
pub use engine::{EngineError, EventHandler, ExecutionEngine, ExecutionEvent};
pub use graph::{ExecutionGraph, ExecutionGroup, GraphError};
pub use runner::{StageJob, StageOutcome, StageRunner, StageUpdate};
pub use scheduler::SchedulingStrategy;
