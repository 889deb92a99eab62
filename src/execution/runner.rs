//! Stage runner - executes the stages of one group against the agent
//!
//! The runner never touches pipeline state. Every transition is published as
//! a `StageUpdate` on the channel handed in by the engine, which owns the
//! state and applies updates in order.

use crate::{
    agent::{AgentError, AgentExecutor, AgentRequest, AgentResponse, ProgressCallback},
    core::{FailurePolicy, StageContext, StageDefinition, StageError, StageStatus},
    execution::{AbortController, SchedulingStrategy},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A stage transition published by the runner
#[derive(Debug, Clone)]
pub enum StageUpdate {
    Dispatched {
        stage: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    Activity {
        stage: String,
        text: String,
    },
    /// The given attempt failed and another one will follow after `delay`
    Retrying {
        stage: String,
        attempt: u32,
        delay: Duration,
        error: StageError,
        at: DateTime<Utc>,
    },
    Succeeded {
        stage: String,
        output: String,
        structured_data: Option<serde_json::Value>,
        at: DateTime<Utc>,
    },
    Failed {
        stage: String,
        error: StageError,
        at: DateTime<Utc>,
    },
    Skipped {
        stage: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl StageUpdate {
    pub fn stage_name(&self) -> &str {
        match self {
            StageUpdate::Dispatched { stage, .. }
            | StageUpdate::Activity { stage, .. }
            | StageUpdate::Retrying { stage, .. }
            | StageUpdate::Succeeded { stage, .. }
            | StageUpdate::Failed { stage, .. }
            | StageUpdate::Skipped { stage, .. } => stage,
        }
    }
}

/// A stage ready to run, with everything its agent gets to see
#[derive(Debug, Clone)]
pub struct StageJob {
    pub stage: StageDefinition,
    pub context: StageContext,
}

/// Terminal result of one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub stage_name: String,
    pub status: StageStatus,
    pub error: Option<StageError>,
    pub output: Option<String>,
    /// Number of dispatches made
    pub attempts: u32,
}

impl StageOutcome {
    fn success(stage_name: String, output: String, attempts: u32) -> Self {
        Self {
            stage_name,
            status: StageStatus::Success,
            error: None,
            output: Some(output),
            attempts,
        }
    }

    fn failed(stage_name: String, error: StageError, attempts: u32) -> Self {
        Self {
            stage_name,
            status: StageStatus::Failed,
            error: Some(error),
            output: None,
            attempts,
        }
    }

    fn skipped(stage_name: String) -> Self {
        Self {
            stage_name,
            status: StageStatus::Skipped,
            error: None,
            output: None,
            attempts: 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(StageError::is_cancellation)
    }
}

/// Forwards agent progress notices as activity updates
struct ActivityForwarder {
    stage: String,
    updates: UnboundedSender<StageUpdate>,
}

impl ProgressCallback for ActivityForwarder {
    fn on_progress(&self, text: &str) {
        let _ = self.updates.send(StageUpdate::Activity {
            stage: self.stage.clone(),
            text: text.to_string(),
        });
    }
}

/// Runs stages with timeout, retry and cancellation
pub struct StageRunner<A> {
    agent: Arc<A>,
    abort: AbortController,
    default_policy: FailurePolicy,
}

impl<A: AgentExecutor + 'static> StageRunner<A> {
    pub fn new(agent: Arc<A>, abort: AbortController, default_policy: FailurePolicy) -> Self {
        Self {
            agent,
            abort,
            default_policy,
        }
    }

    /// Run every job of a group and return one outcome per job, in job order
    pub async fn run_group(
        self: &Arc<Self>,
        jobs: Vec<StageJob>,
        strategy: SchedulingStrategy,
        updates: UnboundedSender<StageUpdate>,
    ) -> Vec<StageOutcome> {
        if self.abort.throw_if_aborted().is_err() {
            info!("Pipeline aborted; not dispatching {} stage(s)", jobs.len());
            return jobs
                .into_iter()
                .map(|job| cancel(job.stage.name, 0, &updates))
                .collect();
        }

        if strategy.runs_sequentially(jobs.len()) {
            self.run_sequential(jobs, &updates).await
        } else {
            let limit = strategy.concurrency_for(jobs.len());
            self.run_concurrent(jobs, limit, &updates).await
        }
    }

    async fn run_sequential(
        &self,
        jobs: Vec<StageJob>,
        updates: &UnboundedSender<StageUpdate>,
    ) -> Vec<StageOutcome> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        let mut halted_by: Option<String> = None;

        for job in jobs {
            if let Some(failed) = &halted_by {
                let reason = format!("not started: '{}' failed under stop policy", failed);
                debug!("Skipping stage {}: {}", job.stage.name, reason);
                let _ = updates.send(StageUpdate::Skipped {
                    stage: job.stage.name.clone(),
                    reason,
                    at: Utc::now(),
                });
                outcomes.push(StageOutcome::skipped(job.stage.name));
                continue;
            }

            let policy = job.stage.effective_policy(self.default_policy);
            let outcome = self.run_stage(job, updates).await;
            if outcome.status == StageStatus::Failed && policy.halts() {
                halted_by = Some(outcome.stage_name.clone());
            }
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn run_concurrent(
        self: &Arc<Self>,
        jobs: Vec<StageJob>,
        limit: usize,
        updates: &UnboundedSender<StageUpdate>,
    ) -> Vec<StageOutcome> {
        let names: Vec<String> = jobs.iter().map(|j| j.stage.name.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut set = JoinSet::new();

        debug!("Dispatching {} stages, at most {} at once", jobs.len(), limit);

        for (index, job) in jobs.into_iter().enumerate() {
            let runner = Arc::clone(self);
            let semaphore = semaphore.clone();
            let updates = updates.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, runner.run_stage(job, &updates).await)
            });
        }

        let mut outcomes: Vec<Option<StageOutcome>> = names.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!("Stage task failed to complete: {}", e),
            }
        }

        outcomes
            .into_iter()
            .zip(names)
            .map(|(outcome, name)| {
                outcome.unwrap_or_else(|| {
                    let error = StageError::failure("stage task panicked");
                    let _ = updates.send(StageUpdate::Failed {
                        stage: name.clone(),
                        error: error.clone(),
                        at: Utc::now(),
                    });
                    StageOutcome::failed(name, error, 0)
                })
            })
            .collect()
    }

    /// Run one stage through all of its attempts
    async fn run_stage(&self, job: StageJob, updates: &UnboundedSender<StageUpdate>) -> StageOutcome {
        let StageJob { stage, context } = job;
        let max_attempts = stage.max_attempts();
        let mut attempt = 0;

        loop {
            if self.abort.throw_if_aborted().is_err() {
                return cancel(stage.name, attempt, updates);
            }

            info!(
                "Dispatching stage {} (attempt {}/{})",
                stage.name,
                attempt + 1,
                max_attempts
            );
            let _ = updates.send(StageUpdate::Dispatched {
                stage: stage.name.clone(),
                attempt,
                at: Utc::now(),
            });

            let failure = match self.run_attempt(&stage, &context, attempt, updates).await {
                Ok(response) if response.success => {
                    info!("Stage {} completed successfully", stage.name);
                    let _ = updates.send(StageUpdate::Succeeded {
                        stage: stage.name.clone(),
                        output: response.output.clone(),
                        structured_data: response.structured_data,
                        at: Utc::now(),
                    });
                    return StageOutcome::success(stage.name, response.output, attempt + 1);
                }
                Ok(response) => StageError::failure(
                    response
                        .error
                        .unwrap_or_else(|| "agent reported an unsuccessful result".to_string()),
                ),
                Err(error) if error.is_cancellation() => {
                    info!("Stage {} cancelled", stage.name);
                    let _ = updates.send(StageUpdate::Failed {
                        stage: stage.name.clone(),
                        error: error.clone(),
                        at: Utc::now(),
                    });
                    return StageOutcome::failed(stage.name, error, attempt + 1);
                }
                Err(error) => error,
            };

            if attempt + 1 < max_attempts {
                let delay = stage
                    .retry
                    .as_ref()
                    .map_or(Duration::ZERO, |retry| retry.delay_for(attempt));
                warn!(
                    "Stage {} attempt {} failed: {}; retrying in {:?}",
                    stage.name,
                    attempt + 1,
                    failure,
                    delay
                );
                let _ = updates.send(StageUpdate::Retrying {
                    stage: stage.name.clone(),
                    attempt,
                    delay,
                    error: failure,
                    at: Utc::now(),
                });

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.abort.cancelled() => {
                        return cancel(stage.name, attempt + 1, updates);
                    }
                }

                attempt += 1;
                continue;
            }

            error!("Stage {} failed: {}", stage.name, failure);
            let _ = updates.send(StageUpdate::Failed {
                stage: stage.name.clone(),
                error: failure.clone(),
                at: Utc::now(),
            });
            return StageOutcome::failed(stage.name, failure, attempt + 1);
        }
    }

    /// One dispatch, bounded by the stage timeout and the pipeline abort
    async fn run_attempt(
        &self,
        stage: &StageDefinition,
        context: &StageContext,
        attempt: u32,
        updates: &UnboundedSender<StageUpdate>,
    ) -> Result<AgentResponse, StageError> {
        // Scoped so a timeout terminates only this attempt's processes
        let scope = self.abort.child();
        let request = AgentRequest {
            stage_name: stage.name.clone(),
            attempt,
            context: context.clone(),
        };
        let activity = ActivityForwarder {
            stage: stage.name.clone(),
            updates: updates.clone(),
        };
        let execution = self.agent.execute(&request, &scope, Some(&activity));

        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(StageError::cancelled()),
            result = tokio::time::timeout(stage.timeout(), execution) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(AgentError::Cancelled)) if self.abort.is_aborted() => {
                    Err(StageError::cancelled())
                }
                Ok(Err(e)) => Err(StageError::failure(e.to_string())),
                Err(_) => {
                    warn!("Stage {} timed out after {}s", stage.name, stage.timeout_secs);
                    scope.abort();
                    Err(StageError::timeout(stage.timeout_secs))
                }
            },
        }
    }
}

fn cancel(stage: String, attempts: u32, updates: &UnboundedSender<StageUpdate>) -> StageOutcome {
    let error = StageError::cancelled();
    let _ = updates.send(StageUpdate::Failed {
        stage: stage.clone(),
        error: error.clone(),
        at: Utc::now(),
    });
    StageOutcome::failed(stage, error, attempts)
}
