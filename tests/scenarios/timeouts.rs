//! Test: Timeouts - stage-local deadlines

use crate::helpers::*;
use crate::mock_agent::{MockAgent, StageScript, Step};
use stagerun::core::{PipelineStatus, StageErrorKind, StageStatus};
use stagerun::execution::TerminationSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const SLOW_YAML: &str = r#"
name: slow
stages:
  - name: soak
    command: ./soak-test.sh
    timeout_secs: 2
    on_fail: continue
  - name: quick
    command: "true"
  - name: report
    command: ./report.sh
    depends_on: [soak]
"#;

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_only_that_stage() {
    let pipeline = pipeline_from_yaml(SLOW_YAML);
    let agent = Arc::new(MockAgent::new().stage("soak", StageScript::hang()));

    let started = Instant::now();
    let result = run_with_mock(&pipeline, &agent).await;

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_pipeline_status(&result, PipelineStatus::Partial);
    assert_stage_error(&result, "soak", StageErrorKind::Timeout);
    assert_stage_status(&result, "quick", StageStatus::Success);
    assert_stage_status(&result, "report", StageStatus::Success);

    let error = result.state.stage("soak").unwrap().error.clone().unwrap();
    assert_eq!(error.message, "Timeout after 2 seconds");
    assert!(error.suggestion.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_terminates_stage_process_once() {
    let pipeline = pipeline_from_yaml(SLOW_YAML);
    let agent = Arc::new(MockAgent::new().stage("soak", StageScript::hang()));
    let abort = stagerun::execution::AbortController::new();
    let engine = engine_with(&agent, abort.clone());

    run_with_engine(&engine, &pipeline).await;

    assert_eq!(
        agent.signals(),
        vec![("soak".to_string(), TerminationSignal::Graceful)]
    );
    // The pipeline itself was never aborted
    assert!(!abort.is_aborted());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_attempt_is_retried_with_fresh_budget() {
    let pipeline = pipeline_from_yaml(
        r#"
name: slow
stages:
  - name: soak
    command: ./soak-test.sh
    timeout_secs: 2
    retry: { max_attempts: 2, initial_delay_ms: 100 }
"#,
    );
    let agent = Arc::new(MockAgent::new().stage(
        "soak",
        StageScript::sequence(vec![Step::Hang, Step::Succeed("soaked".to_string())]),
    ));

    let result = run_with_mock(&pipeline, &agent).await;

    assert_pipeline_status(&result, PipelineStatus::Completed);
    let record = result.state.stage("soak").unwrap();
    assert_eq!(record.retry_attempt, 1);
    assert_eq!(record.output.as_deref(), Some("soaked"));
    assert_eq!(agent.signals().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_stage_within_timeout_succeeds() {
    let pipeline = pipeline_from_yaml(SLOW_YAML);
    let agent = Arc::new(
        MockAgent::new().stage("soak", StageScript::ok("soaked").with_delay(Duration::from_millis(1_900))),
    );

    let result = run_with_mock(&pipeline, &agent).await;

    assert_pipeline_status(&result, PipelineStatus::Completed);
}
