//! Registry replacement with objects built by the local engine. The
//! executor's restart verb drives this under the run lock.

use std::{sync::Arc, time::Duration};

use sluice_core::prelude::*;

fn configuration() -> PipelineConfiguration {
    PipelineConfiguration::new(
        PipelineDefinition::new(
            "load".into(),
            vec![StepDefinition {
                rows: 3,
                ..StepDefinition::new("read".into())
            }],
        ),
        ExecutionConfiguration::default(),
    )
}

async fn finished(execution: &dyn PipelineExecution) -> LifecycleState {
    let mut completion = execution.completion();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        completion.wait_for(|state| state.is_terminal()),
    )
    .await
    .unwrap()
    .unwrap();
    *state
}

#[tokio::test]
async fn replace_swaps_object_and_bumps_generation() {
    let log_store = Arc::new(LogStore::new(100, None));
    let engine = LocalEngine::new(Arc::clone(&log_store));
    let registry = PipelineRegistry::new();

    let configuration = configuration();
    let first = engine.build_pipeline(&configuration, None).unwrap();
    let entry = registry
        .add("load", "run-1", Arc::clone(&first), configuration)
        .unwrap();

    first.start().await.unwrap();
    assert_eq!(finished(first.as_ref()).await, LifecycleState::Finished);

    let handle = registry.get("run-1").unwrap();
    let rebuilt = engine.build_pipeline(&handle.config, None).unwrap();
    log_store.discard(first.log_channel_id());
    registry
        .replace(&entry, Arc::clone(&rebuilt), Arc::clone(&handle.config))
        .unwrap();

    let current = registry.get("run-1").unwrap();
    assert_eq!(current.generation, handle.generation + 1);
    assert!(!Arc::ptr_eq(&current.object, &first));
    assert_eq!(current.object.state(), LifecycleState::Waiting);

    current.object.start().await.unwrap();
    assert_eq!(finished(current.object.as_ref()).await, LifecycleState::Finished);
    assert_eq!(registry.list(), vec![entry]);
    assert!(log_store.lines_from(first.log_channel_id(), 0).lines.is_empty());
}
