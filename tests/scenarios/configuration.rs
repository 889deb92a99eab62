//! Test: Configuration - failures detected before any stage runs

use crate::helpers::*;
use crate::mock_agent::MockAgent;
use stagerun::core::config::PipelineConfig;
use stagerun::core::{Pipeline, StageDefinition};
use stagerun::execution::{AbortController, EngineError, GraphError};
use std::sync::{Arc, Mutex};

#[test]
fn test_cycle_rejected_at_load() {
    let yaml = r#"
name: cyclic
stages:
  - name: a
    command: "true"
    depends_on: [c]
  - name: b
    command: "true"
    depends_on: [a]
  - name: c
    command: "true"
    depends_on: [b]
"#;
    let err = PipelineConfig::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("cycle"), "{}", err);
}

#[test]
fn test_unknown_dependency_rejected_at_load() {
    let yaml = r#"
name: typo
stages:
  - name: test
    command: cargo test
    depends_on: [biuld]
"#;
    let err = PipelineConfig::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("biuld"), "{}", err);
}

#[tokio::test]
async fn test_engine_refuses_cyclic_pipeline() {
    let pipeline = Pipeline::new(
        "cyclic",
        vec![
            StageDefinition::new("build"),
            StageDefinition::new("a").depends_on(["build", "b"]),
            StageDefinition::new("b").depends_on(["a"]),
        ],
    );
    let agent = Arc::new(MockAgent::new());
    let engine = engine_with(&agent, AbortController::new());
    let events = Arc::new(Mutex::new(0usize));
    let counter = events.clone();
    engine.add_event_handler(move |_, _| *counter.lock().unwrap() += 1);

    let result = engine.execute(&pipeline).await;

    match result {
        Err(EngineError::Config(GraphError::Cycle(stages))) => {
            assert_eq!(stages, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected cycle error, got {:?}", other.map(|s| s.status)),
    }
    // Not even the acyclic stage ran
    assert!(agent.dispatches().is_empty());
    assert_eq!(*events.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_engine_refuses_unknown_dependency() {
    let pipeline = Pipeline::new(
        "typo",
        vec![StageDefinition::new("test").depends_on(["biuld"])],
    );
    let agent = Arc::new(MockAgent::new());

    let result = engine_with(&agent, AbortController::new()).execute(&pipeline).await;

    assert!(matches!(
        result,
        Err(EngineError::Config(GraphError::UnknownDependency { .. }))
    ));
    assert!(agent.dispatches().is_empty());
}
