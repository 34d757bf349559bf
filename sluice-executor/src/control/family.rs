use std::sync::Arc;

use sluice_core::{
    prelude::*,
    registry::Registry,
    status::{job_status, pipeline_status},
};

use crate::ApiContext;

/// One resource family of the control plane: which registry, how to build and report
pub trait Family: Send + Sync + 'static {
    type Object: ?Sized + Execution + 'static;
    type Config: Send + Sync + 'static;

    const KIND: ExecutionKind;

    fn registry(context: &ApiContext) -> &Registry<Self::Object, Self::Config>;

    fn name(config: &Self::Config) -> &str;

    fn repository(config: &Self::Config) -> Option<&RepositoryReference>;

    fn build(
        context: &ApiContext,
        config: &Self::Config,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<Self::Object>, EngineError>;

    fn snapshot(run_id: &str, object: &Self::Object) -> ExecutionStatus;

    /// Release node resources held on behalf of a removed run
    fn release(_context: &ApiContext, _run_id: &str) {}
}

pub struct Pipelines;

impl Family for Pipelines {
    type Object = dyn PipelineExecution;
    type Config = PipelineConfiguration;

    const KIND: ExecutionKind = ExecutionKind::Pipeline;

    fn registry(context: &ApiContext) -> &Registry<Self::Object, Self::Config> {
        &context.pipelines
    }

    fn name(config: &Self::Config) -> &str {
        &config.definition.name
    }

    fn repository(config: &Self::Config) -> Option<&RepositoryReference> {
        config.configuration.repository.as_ref()
    }

    fn build(
        context: &ApiContext,
        config: &Self::Config,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<Self::Object>, EngineError> {
        context.factory.build_pipeline(config, repository)
    }

    fn snapshot(run_id: &str, object: &Self::Object) -> ExecutionStatus {
        pipeline_status(run_id, object)
    }

    fn release(context: &ApiContext, run_id: &str) {
        context.broker.release_run(run_id);
    }
}

pub struct Jobs;

impl Family for Jobs {
    type Object = dyn Execution;
    type Config = JobConfiguration;

    const KIND: ExecutionKind = ExecutionKind::Job;

    fn registry(context: &ApiContext) -> &Registry<Self::Object, Self::Config> {
        &context.jobs
    }

    fn name(config: &Self::Config) -> &str {
        &config.definition.name
    }

    fn repository(config: &Self::Config) -> Option<&RepositoryReference> {
        config.configuration.repository.as_ref()
    }

    fn build(
        context: &ApiContext,
        config: &Self::Config,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<Self::Object>, EngineError> {
        context.factory.build_job(config, repository)
    }

    fn snapshot(run_id: &str, object: &Self::Object) -> ExecutionStatus {
        job_status(run_id, object)
    }
}
