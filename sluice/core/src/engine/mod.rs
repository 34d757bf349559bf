//! In-process engine running pipelines and jobs on the tokio runtime.
//!
//! Step copies produce synthetic rows according to their definition,
//! which makes a node fully operable without an external engine.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use sluice_protocol::configuration::{JobConfiguration, PipelineConfiguration};
use tracing::debug;
use uuid::Uuid;

use crate::{
    execution::{EngineError, Execution, ExecutionFactory, PipelineExecution},
    log_store::LogStore,
    repository::RepositoryConnection,
};

mod job;
mod lifecycle;
mod pipeline;

pub use job::LocalJob;
pub use pipeline::LocalPipeline;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory for [`LocalPipeline`] and [`LocalJob`] objects writing into a shared log store
pub struct LocalEngine {
    log_store: Arc<LogStore>,
}

impl LocalEngine {
    pub fn new(log_store: Arc<LogStore>) -> Self {
        Self { log_store }
    }
}

fn check_names<'a>(
    kind: &str,
    name: &str,
    children: impl ExactSizeIterator<Item = &'a str>,
) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidDefinition(format!(
            "{kind} name must not be empty"
        )));
    }
    if children.len() == 0 {
        return Err(EngineError::InvalidDefinition(format!(
            "{kind} '{name}' has nothing to run"
        )));
    }

    let mut seen = HashSet::new();
    for child in children {
        if child.trim().is_empty() {
            return Err(EngineError::InvalidDefinition(format!(
                "{kind} '{name}' contains an unnamed element"
            )));
        }
        if !seen.insert(child) {
            return Err(EngineError::InvalidDefinition(format!(
                "{kind} '{name}' defines '{child}' more than once"
            )));
        }
    }
    Ok(())
}

impl ExecutionFactory for LocalEngine {
    fn build_pipeline(
        &self,
        configuration: &PipelineConfiguration,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<dyn PipelineExecution>, EngineError> {
        let definition = &configuration.definition;
        check_names(
            "pipeline",
            &definition.name,
            definition.steps.iter().map(|step| step.name.as_str()),
        )?;
        if let Some(step) = definition.steps.iter().find(|step| step.copies == 0) {
            return Err(EngineError::InvalidDefinition(format!(
                "step '{}' needs at least one copy",
                step.name
            )));
        }

        let log_channel_id = Uuid::new_v4().to_string();
        debug!(pipeline = %definition.name, log_channel = %log_channel_id, "Building pipeline");

        Ok(Arc::new(LocalPipeline::new(
            definition.clone(),
            configuration.configuration.clone(),
            Arc::clone(&self.log_store),
            log_channel_id,
            repository,
        )))
    }

    fn build_job(
        &self,
        configuration: &JobConfiguration,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<dyn Execution>, EngineError> {
        let definition = &configuration.definition;
        check_names(
            "job",
            &definition.name,
            definition.entries.iter().map(|entry| entry.name.as_str()),
        )?;

        let log_channel_id = Uuid::new_v4().to_string();
        debug!(job = %definition.name, log_channel = %log_channel_id, "Building job");

        Ok(Arc::new(LocalJob::new(
            definition.clone(),
            configuration.configuration.clone(),
            Arc::clone(&self.log_store),
            log_channel_id,
            repository,
        )))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use sluice_protocol::{
        configuration::ExecutionConfiguration,
        definition::{EntryDefinition, JobDefinition, PipelineDefinition, StepDefinition},
        status::LifecycleState,
    };

    use super::*;

    fn engine() -> LocalEngine {
        LocalEngine::new(Arc::new(LogStore::new(100, None)))
    }

    fn pipeline(name: &str, steps: Vec<StepDefinition>) -> PipelineConfiguration {
        PipelineConfiguration::new(
            PipelineDefinition::new(name.into(), steps),
            ExecutionConfiguration::default(),
        )
    }

    #[rstest]
    #[case::empty_name(pipeline(" ", vec![StepDefinition::new("a".into())]), "name must not be empty")]
    #[case::no_steps(pipeline("p", vec![]), "has nothing to run")]
    #[case::duplicate_steps(
        pipeline("p", vec![StepDefinition::new("a".into()), StepDefinition::new("a".into())]),
        "defines 'a' more than once"
    )]
    #[case::zero_copies(
        pipeline("p", vec![StepDefinition { copies: 0, ..StepDefinition::new("a".into()) }]),
        "needs at least one copy"
    )]
    fn invalid_pipeline_definitions_are_rejected(
        #[case] configuration: PipelineConfiguration,
        #[case] expected: &str,
    ) {
        let error = engine().build_pipeline(&configuration, None).err().unwrap();

        assert!(matches!(error, EngineError::InvalidDefinition(_)));
        assert!(error.to_string().contains(expected), "{error}");
    }

    #[test]
    fn every_build_gets_a_fresh_log_channel() {
        let engine = engine();
        let configuration = pipeline("p", vec![StepDefinition::new("a".into())]);

        let first = engine.build_pipeline(&configuration, None).unwrap();
        let second = engine.build_pipeline(&configuration, None).unwrap();

        assert_ne!(first.log_channel_id(), second.log_channel_id());
        assert_eq!(first.state(), LifecycleState::Waiting);
        assert_eq!(first.name(), "p");
    }

    #[test]
    fn job_without_entries_is_rejected() {
        let configuration = JobConfiguration::new(
            JobDefinition::new("j".into(), vec![]),
            ExecutionConfiguration::default(),
        );

        assert!(engine().build_job(&configuration, None).is_err());

        let configuration = JobConfiguration::new(
            JobDefinition::new("j".into(), vec![EntryDefinition::new("a".into())]),
            ExecutionConfiguration::default(),
        );
        assert!(engine().build_job(&configuration, None).is_ok());
    }
}
