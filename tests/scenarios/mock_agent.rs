//! Mock agent for deterministic, fast scenario tests

use async_trait::async_trait;
use stagerun::agent::{AgentError, AgentExecutor, AgentRequest, AgentResponse, ProgressCallback};
use stagerun::execution::{AbortController, ProcessHandle, TerminationSignal};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// What one attempt of a stage does
#[derive(Debug, Clone)]
pub enum Step {
    /// Return a successful response with this output
    Succeed(String),
    /// Return an unsuccessful response with this error
    Fail(String),
    /// Register a fake process and wait until aborted
    Hang,
}

/// Per-stage behaviour. Attempt `n` uses `steps[n]`, the last step repeats.
#[derive(Debug, Clone)]
pub struct StageScript {
    steps: Vec<Step>,
    delay: Duration,
    activity: Vec<String>,
}

impl StageScript {
    pub fn ok(output: &str) -> Self {
        Self::sequence(vec![Step::Succeed(output.to_string())])
    }

    pub fn failing(error: &str) -> Self {
        Self::sequence(vec![Step::Fail(error.to_string())])
    }

    pub fn hang() -> Self {
        Self::sequence(vec![Step::Hang])
    }

    pub fn sequence(steps: Vec<Step>) -> Self {
        Self {
            steps,
            delay: Duration::ZERO,
            activity: Vec::new(),
        }
    }

    /// Simulated work before the step's result
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Progress notices emitted on every attempt
    pub fn with_activity(mut self, notices: &[&str]) -> Self {
        self.activity = notices.iter().map(|s| s.to_string()).collect();
        self
    }

    fn step(&self, attempt: u32) -> Step {
        let index = (attempt as usize).min(self.steps.len().saturating_sub(1));
        self.steps
            .get(index)
            .cloned()
            .unwrap_or_else(|| Step::Succeed(String::new()))
    }
}

/// Process double that exits as soon as it receives any signal
pub struct FakeProcess {
    stage: String,
    exited: watch::Sender<bool>,
    signals: Arc<Mutex<Vec<(String, TerminationSignal)>>>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        !*self.exited.borrow()
    }

    fn signal(&self, signal: TerminationSignal) -> io::Result<()> {
        self.signals.lock().unwrap().push((self.stage.clone(), signal));
        self.exited.send_replace(true);
        Ok(())
    }

    async fn exited(&self) {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

/// Mock agent that plays back scripted behaviour per stage
///
/// Stages without a script succeed immediately with `"<stage> done"`.
#[derive(Default)]
pub struct MockAgent {
    scripts: HashMap<String, StageScript>,
    /// Every dispatch as (stage, attempt), in order
    dispatches: Mutex<Vec<(String, u32)>>,
    /// "start:<stage>" / "end:<stage>" markers, in order
    timeline: Mutex<Vec<String>>,
    requests: Mutex<Vec<AgentRequest>>,
    signals: Arc<Mutex<Vec<(String, TerminationSignal)>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, name: &str, script: StageScript) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    pub fn dispatches(&self) -> Vec<(String, u32)> {
        self.dispatches.lock().unwrap().clone()
    }

    pub fn dispatch_count(&self, stage: &str) -> usize {
        self.dispatches
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == stage)
            .count()
    }

    pub fn timeline(&self) -> Vec<String> {
        self.timeline.lock().unwrap().clone()
    }

    pub fn request_for(&self, stage: &str) -> Option<AgentRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.stage_name == stage)
            .cloned()
    }

    pub fn signals(&self) -> Vec<(String, TerminationSignal)> {
        self.signals.lock().unwrap().clone()
    }

    /// Highest number of stages that were executing at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter even when the attempt is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentExecutor for MockAgent {
    async fn execute(
        &self,
        request: &AgentRequest,
        abort: &AbortController,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<AgentResponse, AgentError> {
        let stage = request.stage_name.clone();
        self.dispatches
            .lock()
            .unwrap()
            .push((stage.clone(), request.attempt));
        self.requests.lock().unwrap().push(request.clone());
        self.timeline.lock().unwrap().push(format!("start:{}", stage));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let script = self
            .scripts
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| StageScript::ok(&format!("{} done", stage)));

        if let Some(cb) = progress {
            for notice in &script.activity {
                cb.on_progress(notice);
            }
        }

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        let result = match script.step(request.attempt) {
            Step::Succeed(output) => Ok(AgentResponse::success(output)),
            Step::Fail(error) => Ok(AgentResponse::failure(error)),
            Step::Hang => {
                let (exited, _) = watch::channel(false);
                abort.register_process(Arc::new(FakeProcess {
                    stage: stage.clone(),
                    exited,
                    signals: self.signals.clone(),
                }));
                abort.cancelled().await;
                Err(AgentError::Cancelled)
            }
        };

        self.timeline.lock().unwrap().push(format!("end:{}", stage));
        result
    }
}
