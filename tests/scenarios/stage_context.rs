//! Test: Stage Context - variables, inputs, upstream outputs and activity

use crate::helpers::*;
use crate::mock_agent::{MockAgent, StageScript};
use stagerun::core::PipelineStatus;
use stagerun::execution::ExecutionEvent;
use std::sync::Arc;

const RELEASE_YAML: &str = r#"
name: release
variables:
  channel: stable
  region: eu-west-1
stages:
  - name: build
    command: cargo build --release
  - name: package
    command: tar czf app.tgz target/release/app
    depends_on: [build]
    inputs:
      format: tgz
      region: us-east-1
  - name: publish
    command: ./publish.sh {{ steps.package.output }} {{ channel }}
    depends_on: [package]
"#;

#[tokio::test(start_paused = true)]
async fn test_dependents_receive_upstream_outputs() {
    let pipeline = pipeline_from_yaml(RELEASE_YAML);
    let agent = Arc::new(
        MockAgent::new()
            .stage("build", StageScript::ok("target/release/app\n"))
            .stage("package", StageScript::ok("app.tgz\n")),
    );

    let result = run_with_mock(&pipeline, &agent).await;
    assert_pipeline_status(&result, PipelineStatus::Completed);

    let publish = agent.request_for("publish").unwrap();
    assert_eq!(
        publish.context.upstream_output("package").map(String::as_str),
        Some("app.tgz\n")
    );
    // Only declared dependencies are forwarded
    assert!(publish.context.upstream_output("build").is_none());
    assert_eq!(
        publish.context.render("./publish.sh {{ steps.package.output }} {{ channel }}"),
        "./publish.sh app.tgz stable"
    );
}

#[tokio::test(start_paused = true)]
async fn test_inputs_override_variables() {
    let pipeline = pipeline_from_yaml(RELEASE_YAML);
    let agent = Arc::new(MockAgent::new());

    run_with_mock(&pipeline, &agent).await;

    let package = agent.request_for("package").unwrap();
    let vars = package.context.rendering_variables();
    assert_eq!(vars.get("region").map(String::as_str), Some("us-east-1"));
    assert_eq!(vars.get("format").map(String::as_str), Some("tgz"));
    assert_eq!(vars.get("channel").map(String::as_str), Some("stable"));
}

#[tokio::test(start_paused = true)]
async fn test_activity_keeps_three_most_recent() {
    let pipeline = pipeline_from_yaml(RELEASE_YAML);
    let agent = Arc::new(MockAgent::new().stage(
        "build",
        StageScript::ok("done").with_activity(&[
            "Compiling serde",
            "Compiling tokio",
            "Compiling app",
            "Linking",
            "Finished",
        ]),
    ));

    let result = run_with_mock(&pipeline, &agent).await;

    let activity: Vec<&str> = result
        .state
        .stage("build")
        .unwrap()
        .tool_activity
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(activity, vec!["Compiling app", "Linking", "Finished"]);
    assert_eq!(
        result.count_events(|e| matches!(e, ExecutionEvent::StageActivity { stage, .. } if stage == "build")),
        5
    );
}

#[tokio::test(start_paused = true)]
async fn test_outputs_and_timing_recorded() {
    let pipeline = pipeline_from_yaml(RELEASE_YAML);
    let agent = Arc::new(MockAgent::new().stage("build", StageScript::ok("built")));

    let result = run_with_mock(&pipeline, &agent).await;

    let build = result.state.stage("build").unwrap();
    assert_eq!(build.output.as_deref(), Some("built"));
    assert!(build.start_time.is_some());
    assert!(build.end_time.is_some());
    assert!(build.duration_ms.is_some());
    assert_eq!(result.state.progress(), 1.0);
}
