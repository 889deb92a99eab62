//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    agent::AgentExecutor,
    core::{
        FailurePolicy, Pipeline, PipelineExecution, PipelineStatus, StageContext, StageDefinition,
        StageError, StageExecution, StageStatus,
    },
    execution::{
        graph::{self, ExecutionGroup, GraphError},
        runner::{StageJob, StageOutcome, StageRunner, StageUpdate},
        AbortController,
    },
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DISABLED_REASON: &str = "stage is disabled";
const HALTED_REASON: &str = "pipeline halted before this stage was dispatched";

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_name: String,
        groups: usize,
    },
    GroupStarted {
        index: usize,
        stages: Vec<String>,
    },
    StageStarted {
        stage: String,
        attempt: u32,
        max_retries: u32,
    },
    StageActivity {
        stage: String,
        text: String,
    },
    StageRetrying {
        stage: String,
        /// The attempt that just failed (0-indexed)
        attempt: u32,
        delay: Duration,
        error: StageError,
    },
    StageCompleted {
        stage: String,
    },
    StageFailed {
        stage: String,
        error: StageError,
        policy: FailurePolicy,
    },
    StageSkipped {
        stage: String,
        reason: String,
    },
    GroupFinished {
        index: usize,
        failed: Vec<String>,
        is_final: bool,
    },
    PipelineFinished {
        execution_id: Uuid,
        status: PipelineStatus,
    },
}

/// Type for event handlers
///
/// Handlers run synchronously on the orchestrating task and see the state
/// after the event was applied.
pub type EventHandler = Arc<dyn Fn(&ExecutionEvent, &PipelineExecution) + Send + Sync>;

/// Errors that prevent a pipeline from running at all
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] GraphError),
}

/// What the engine decided after a group finished
#[derive(Debug, Default)]
struct GroupVerdict {
    failed: Vec<String>,
    halt: bool,
}

/// Main pipeline execution engine
///
/// An engine is scoped to one pipeline run: its abort controller, once
/// fired, stays fired.
pub struct ExecutionEngine<A> {
    agent: Arc<A>,
    abort: AbortController,
    event_handlers: Mutex<Vec<EventHandler>>,
}

impl<A: AgentExecutor + 'static> ExecutionEngine<A> {
    pub fn new(agent: A) -> Self {
        Self::with_abort_controller(agent, AbortController::new())
    }

    pub fn with_abort_controller(agent: A, abort: AbortController) -> Self {
        Self {
            agent: Arc::new(agent),
            abort,
            event_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Controller that aborts this engine's run
    pub fn abort_controller(&self) -> AbortController {
        self.abort.clone()
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(&ExecutionEvent, &PipelineExecution) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.event_handlers.lock() {
            handlers.push(Arc::new(handler));
        }
    }

    /// Emit an event to all handlers
    fn emit(&self, event: ExecutionEvent, state: &PipelineExecution) {
        let handlers: Vec<EventHandler> = match self.event_handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        for handler in &handlers {
            handler(&event, state);
        }
    }

    /// Execute the entire pipeline
    ///
    /// Configuration errors are returned before any stage is dispatched.
    /// Stage failures, timeouts and aborts are reported through the returned
    /// execution record instead.
    pub async fn execute(&self, pipeline: &Pipeline) -> Result<PipelineExecution, EngineError> {
        let graph = graph::validate(&pipeline.stages).inspect_err(|e| {
            error!("Refusing to run pipeline {}: {}", pipeline.name, e);
        })?;

        let mut state = PipelineExecution::new(
            &pipeline.name,
            pipeline
                .stages
                .iter()
                .map(|s| StageExecution::pending(&s.name, s.max_attempts() - 1))
                .collect(),
        );
        let execution_id = state.execution_id;

        info!(
            "Starting pipeline execution: {} ({}) with {} group(s)",
            pipeline.name,
            execution_id,
            graph.groups.len()
        );
        self.emit(
            ExecutionEvent::PipelineStarted {
                execution_id,
                pipeline_name: pipeline.name.clone(),
                groups: graph.groups.len(),
            },
            &state,
        );

        let runner = Arc::new(StageRunner::new(
            self.agent.clone(),
            self.abort.clone(),
            pipeline.default_on_fail,
        ));
        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut halted = false;

        for group in &graph.groups {
            let verdict = self
                .run_group(pipeline, &runner, group, &mut outputs, &mut state)
                .await;

            let is_final = graph.is_final_group(group.index);
            self.emit(
                ExecutionEvent::GroupFinished {
                    index: group.index,
                    failed: verdict.failed,
                    is_final,
                },
                &state,
            );

            if verdict.halt {
                halted = true;
                break;
            }
        }

        let status = if halted {
            self.skip_undispatched(&mut state);
            PipelineStatus::Failed
        } else if state.status == PipelineStatus::Partial {
            PipelineStatus::Partial
        } else {
            PipelineStatus::Completed
        };
        state.finish(status);

        info!("Pipeline {} finished with status {:?}", pipeline.name, status);
        self.emit(
            ExecutionEvent::PipelineFinished {
                execution_id,
                status,
            },
            &state,
        );

        Ok(state)
    }

    async fn run_group(
        &self,
        pipeline: &Pipeline,
        runner: &Arc<StageRunner<A>>,
        group: &ExecutionGroup,
        outputs: &mut HashMap<String, String>,
        state: &mut PipelineExecution,
    ) -> GroupVerdict {
        info!(
            "Starting group {} with {} stage(s)",
            group.index,
            group.len()
        );
        self.emit(
            ExecutionEvent::GroupStarted {
                index: group.index,
                stages: group.stage_names(),
            },
            state,
        );

        let mut jobs = Vec::with_capacity(group.len());
        for stage in &group.stages {
            if !stage.enabled {
                debug!("Skipping disabled stage {}", stage.name);
                self.apply(
                    state,
                    pipeline,
                    StageUpdate::Skipped {
                        stage: stage.name.clone(),
                        reason: DISABLED_REASON.to_string(),
                        at: Utc::now(),
                    },
                );
                continue;
            }
            jobs.push(StageJob {
                stage: stage.clone(),
                context: build_context(pipeline, stage, outputs),
            });
        }

        if jobs.is_empty() {
            return GroupVerdict {
                halt: self.abort.is_aborted(),
                ..Default::default()
            };
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = runner.run_group(jobs, pipeline.strategy, tx);
        tokio::pin!(run);

        let outcomes = loop {
            tokio::select! {
                outcomes = &mut run => break outcomes,
                Some(update) = rx.recv() => self.apply(state, pipeline, update),
            }
        };
        while let Ok(update) = rx.try_recv() {
            self.apply(state, pipeline, update);
        }

        self.judge(pipeline, &outcomes, outputs, state)
    }

    /// Apply failure policies to a finished group
    fn judge(
        &self,
        pipeline: &Pipeline,
        outcomes: &[StageOutcome],
        outputs: &mut HashMap<String, String>,
        state: &mut PipelineExecution,
    ) -> GroupVerdict {
        let mut verdict = GroupVerdict::default();

        for outcome in outcomes {
            match outcome.status {
                StageStatus::Success => {
                    if let Some(output) = &outcome.output {
                        outputs.insert(outcome.stage_name.clone(), output.clone());
                    }
                }
                StageStatus::Failed => {
                    verdict.failed.push(outcome.stage_name.clone());
                    let policy = self.policy_of(pipeline, &outcome.stage_name);
                    match policy {
                        _ if outcome.is_cancelled() => verdict.halt = true,
                        FailurePolicy::Stop => verdict.halt = true,
                        FailurePolicy::Continue => state.mark_partial(),
                        FailurePolicy::Warn => {
                            warn!(
                                "Stage {} failed; continuing under warn policy",
                                outcome.stage_name
                            );
                            state.mark_partial();
                        }
                    }
                }
                _ => {}
            }
        }

        if self.abort.is_aborted() {
            info!("Pipeline aborted; not starting further groups");
            verdict.halt = true;
        }

        verdict
    }

    fn policy_of(&self, pipeline: &Pipeline, stage: &str) -> FailurePolicy {
        pipeline
            .stage(stage)
            .map_or(pipeline.default_on_fail, |s| {
                s.effective_policy(pipeline.default_on_fail)
            })
    }

    /// Record an update from the runner and notify handlers
    fn apply(&self, state: &mut PipelineExecution, pipeline: &Pipeline, update: StageUpdate) {
        let Some(record) = state.stage_mut(update.stage_name()) else {
            warn!("Update for unknown stage {}", update.stage_name());
            return;
        };

        let event = match update {
            StageUpdate::Dispatched { stage, attempt, at } => {
                record.start_attempt(attempt, at);
                ExecutionEvent::StageStarted {
                    stage,
                    attempt,
                    max_retries: record.max_retries,
                }
            }
            StageUpdate::Activity { stage, text } => {
                record.push_activity(text.clone());
                ExecutionEvent::StageActivity { stage, text }
            }
            StageUpdate::Retrying {
                stage,
                attempt,
                delay,
                error,
                at,
            } => {
                record.fail(error.clone(), at);
                ExecutionEvent::StageRetrying {
                    stage,
                    attempt,
                    delay,
                    error,
                }
            }
            StageUpdate::Succeeded {
                stage,
                output,
                structured_data,
                at,
            } => {
                record.succeed(output, structured_data, at);
                ExecutionEvent::StageCompleted { stage }
            }
            StageUpdate::Failed { stage, error, at } => {
                record.fail(error.clone(), at);
                let policy = self.policy_of(pipeline, &stage);
                ExecutionEvent::StageFailed {
                    stage,
                    error,
                    policy,
                }
            }
            StageUpdate::Skipped { stage, reason, at } => {
                record.skip(reason.clone(), at);
                ExecutionEvent::StageSkipped { stage, reason }
            }
        };

        self.emit(event, state);
    }

    /// Mark every stage that never left pending as skipped
    fn skip_undispatched(&self, state: &mut PipelineExecution) {
        let pending: Vec<String> = state
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Pending)
            .map(|s| s.stage_name.clone())
            .collect();

        for stage in pending {
            if let Some(record) = state.stage_mut(&stage) {
                record.skip(HALTED_REASON, Utc::now());
            }
            self.emit(
                ExecutionEvent::StageSkipped {
                    stage,
                    reason: HALTED_REASON.to_string(),
                },
                state,
            );
        }
    }
}

/// Context for one stage: variables, inputs and outputs of succeeded dependencies
fn build_context(
    pipeline: &Pipeline,
    stage: &StageDefinition,
    outputs: &HashMap<String, String>,
) -> StageContext {
    let mut context = StageContext {
        variables: pipeline.variables.clone(),
        inputs: stage.inputs.clone(),
        upstream_outputs: HashMap::new(),
    };
    for dep in &stage.depends_on {
        if let Some(output) = outputs.get(dep) {
            context.set_upstream_output(dep, output.clone());
        }
    }
    context
}
