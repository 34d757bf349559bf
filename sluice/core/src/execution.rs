//! The seam between the control plane and the engine running executions.
//!
//! An execution object is an opaque, stateful handle for one run of a
//! pipeline or job. The control plane never reaches into its internals:
//! it drives the lifecycle through these traits and reads status back.
//!
//! Implementations must serialize their own lifecycle transitions and
//! report illegal ones as [`EngineError::IllegalTransition`] instead of
//! silently resetting state.

use std::sync::Arc;

use async_trait::async_trait;
use sluice_protocol::{
    cluster::{RowSample, SniffKind},
    configuration::{
        ExecutionConfiguration, ExecutionResult, JobConfiguration, PipelineConfiguration,
    },
    status::{LifecycleState, StepRuntimeStatus},
};
use thiserror::Error;
use tokio::sync::watch;

use crate::repository::{RepositoryConnection, RepositoryError};

/// Errors reported by execution objects and factories
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("illegal lifecycle transition from '{from}' to '{to}'")]
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("cannot {operation} while '{state}'")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("step '{step}' copy {copy} not found")]
    StepNotFound { step: String, copy: u32 },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Lifecycle operations shared by pipelines and jobs
#[async_trait]
pub trait Execution: Send + Sync {
    /// Pipeline or job name
    fn name(&self) -> &str;

    /// Channel under which this object's log lines are buffered
    fn log_channel_id(&self) -> &str;

    fn state(&self) -> LifecycleState;

    /// Error the run failed with, if any
    fn error(&self) -> Option<String>;

    /// Result of the run once it reached a terminal state
    fn result(&self) -> Option<ExecutionResult>;

    /// Start the run. Prepares first when the object was never prepared.
    async fn start(&self) -> Result<(), EngineError>;

    /// Signal the run to halt. Returns once the signal is issued.
    async fn stop(&self) -> Result<(), EngineError>;

    /// Receiver observing every lifecycle transition of this object
    fn completion(&self) -> watch::Receiver<LifecycleState>;
}

/// Pipeline specific lifecycle operations
#[async_trait]
pub trait PipelineExecution: Execution {
    /// Apply the configuration and move to `Initialized` without running
    async fn prepare(&self, configuration: &ExecutionConfiguration) -> Result<(), EngineError>;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    /// Release per-run resources held by the steps
    async fn cleanup(&self) -> Result<(), EngineError>;

    /// Status of every step copy, idle ones included
    fn step_statuses(&self) -> Vec<StepRuntimeStatus>;

    /// The most recent rows seen by a step copy
    fn sniff(
        &self,
        step: &str,
        copy: u32,
        kind: SniffKind,
        lines: usize,
    ) -> Result<RowSample, EngineError>;
}

/// Builds execution objects from submitted configurations
pub trait ExecutionFactory: Send + Sync {
    fn build_pipeline(
        &self,
        configuration: &PipelineConfiguration,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<dyn PipelineExecution>, EngineError>;

    fn build_job(
        &self,
        configuration: &JobConfiguration,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<dyn Execution>, EngineError>;
}
