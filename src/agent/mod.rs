//! Agents - the workers that perform a stage's actual work

pub mod command;
pub mod process;
pub mod response;

use crate::execution::AbortController;
use async_trait::async_trait;
pub use command::{CommandAgent, CommandSpec};
pub use process::ChildProcessHandle;
pub use response::{AgentError, AgentRequest, AgentResponse};

/// Trait for agent execution - allows for different implementations
///
/// Implementations that spawn processes should register them with `abort`
/// and should return `AgentError::Cancelled` once `abort` fires.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run one attempt of a stage
    async fn execute(
        &self,
        request: &AgentRequest,
        abort: &AbortController,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<AgentResponse, AgentError>;
}

#[async_trait]
impl<T: AgentExecutor + ?Sized> AgentExecutor for std::sync::Arc<T> {
    async fn execute(
        &self,
        request: &AgentRequest,
        abort: &AbortController,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<AgentResponse, AgentError> {
        (**self).execute(request, abort, progress).await
    }
}

/// Callback for progress notices an agent emits while it works
///
/// This trait is object-safe and can be used as `&dyn ProgressCallback`.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, text: &str);
}

/// No-op callback that does nothing
#[derive(Debug, Clone, Default)]
pub struct NoopCallback;

impl ProgressCallback for NoopCallback {
    fn on_progress(&self, _text: &str) {}
}
