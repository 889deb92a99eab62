//! Test: Retry Behavior - attempt budget and backoff delays

use crate::helpers::*;
use crate::mock_agent::{MockAgent, StageScript, Step};
use stagerun::core::{PipelineStatus, StageStatus};
use stagerun::execution::ExecutionEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn flaky_yaml(max_attempts: u32, backoff: &str, initial_ms: u64, max_ms: u64) -> String {
    format!(
        r#"
name: flaky
stages:
  - name: fetch
    command: curl -f https://example.invalid
    retry:
      max_attempts: {}
      backoff: {}
      initial_delay_ms: {}
      max_delay_ms: {}
"#,
        max_attempts, backoff, initial_ms, max_ms
    )
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_on_third_attempt() {
    let pipeline = pipeline_from_yaml(&flaky_yaml(3, "fixed", 10, 10));
    let agent = Arc::new(MockAgent::new().stage(
        "fetch",
        StageScript::sequence(vec![
            Step::Fail("connection reset".to_string()),
            Step::Fail("connection reset".to_string()),
            Step::Succeed("payload".to_string()),
        ]),
    ));

    let result = run_with_mock(&pipeline, &agent).await;

    assert_pipeline_status(&result, PipelineStatus::Completed);
    let record = result.state.stage("fetch").unwrap();
    assert_eq!(record.status, StageStatus::Success);
    assert_eq!(record.retry_attempt, 2);
    assert_eq!(record.max_retries, 2);
    assert!(record.error.is_none());

    let attempts: Vec<u32> = agent.dispatches().into_iter().map(|(_, attempt)| attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(
        result.count_events(|e| matches!(e, ExecutionEvent::StageRetrying { .. })),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_stage() {
    let pipeline = pipeline_from_yaml(&flaky_yaml(3, "fixed", 10, 10));
    let agent = Arc::new(MockAgent::new().stage("fetch", StageScript::failing("404")));

    let result = run_with_mock(&pipeline, &agent).await;

    assert_pipeline_status(&result, PipelineStatus::Failed);
    assert_eq!(agent.dispatch_count("fetch"), 3);
    let record = result.state.stage("fetch").unwrap();
    assert_eq!(record.status, StageStatus::Failed);
    assert_eq!(record.retry_attempt, 2);
    assert_eq!(record.error.as_ref().unwrap().message, "404");
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_config_means_single_attempt() {
    let pipeline = pipeline_from_yaml(
        r#"
name: once
stages:
  - name: fetch
    command: curl -f https://example.invalid
"#,
    );
    let agent = Arc::new(MockAgent::new().stage("fetch", StageScript::failing("404")));

    let result = run_with_mock(&pipeline, &agent).await;

    assert_eq!(agent.dispatch_count("fetch"), 1);
    assert_eq!(result.state.stage("fetch").unwrap().max_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_delays() {
    // Delays after attempts 0, 1, 2: 100ms, 200ms, 400ms
    let pipeline = pipeline_from_yaml(&flaky_yaml(4, "exponential", 100, 10_000));
    let agent = Arc::new(MockAgent::new().stage("fetch", StageScript::failing("503")));

    let started = Instant::now();
    let result = run_with_mock(&pipeline, &agent).await;
    let elapsed = started.elapsed();

    assert_eq!(agent.dispatch_count("fetch"), 4);
    assert!(elapsed >= Duration::from_millis(700), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(800), "elapsed {:?}", elapsed);

    let delays: Vec<Duration> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::StageRetrying { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_capped_at_max_delay() {
    let pipeline = pipeline_from_yaml(&flaky_yaml(4, "linear", 500, 800));
    let agent = Arc::new(MockAgent::new().stage("fetch", StageScript::failing("503")));

    let result = run_with_mock(&pipeline, &agent).await;

    let delays: Vec<Duration> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::StageRetrying { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(500),
            Duration::from_millis(800),
            Duration::from_millis(800)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_reenters_running_with_attempt_number() {
    let pipeline = pipeline_from_yaml(&flaky_yaml(2, "fixed", 10, 10));
    let agent = Arc::new(MockAgent::new().stage(
        "fetch",
        StageScript::sequence(vec![
            Step::Fail("timeout".to_string()),
            Step::Succeed("ok".to_string()),
        ]),
    ));

    let result = run_with_mock(&pipeline, &agent).await;

    let started: Vec<(u32, u32)> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::StageStarted {
                attempt,
                max_retries,
                ..
            } => Some((*attempt, *max_retries)),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![(0, 1), (1, 1)]);
    assert_stage_status(&result, "fetch", StageStatus::Success);
}
