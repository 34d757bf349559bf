//! Core building blocks of a sluice node
//!
//! A sluice node hosts many long-lived, stateful, cancellable executions
//! of pipelines and jobs. This crate holds everything the control plane
//! needs that is independent of HTTP:
//!
//! - **execution**: the seam to the engine that actually runs pipelines and jobs
//! - **registry**: the concurrency-safe store of executions keyed by run id
//! - **log_store**: buffered execution logs addressed by log channel
//! - **port_broker**: allocation of ports for cross-node row streaming
//! - **status**: point-in-time status snapshots
//! - **sequence**: node-local sequences handed out in blocks
//! - **repository**: the seam to metadata repositories referenced by submissions
//! - **engine**: an in-process engine implementing the execution seam

pub mod engine;
pub mod execution;
pub mod log_store;
pub mod port_broker;
pub mod registry;
pub mod repository;
pub mod sequence;
pub mod status;

pub use sluice_protocol as protocol;

use execution::{Execution, PipelineExecution};
use sluice_protocol::configuration::{JobConfiguration, PipelineConfiguration};

/// Registry of pipeline executions together with their submitted configuration
pub type PipelineRegistry = registry::Registry<dyn PipelineExecution, PipelineConfiguration>;

/// Registry of job executions together with their submitted configuration
pub type JobRegistry = registry::Registry<dyn Execution, JobConfiguration>;

/// Prelude to import all relevant types
pub mod prelude {
    pub use super::engine::LocalEngine;
    pub use super::execution::{EngineError, Execution, ExecutionFactory, PipelineExecution};
    pub use super::log_store::LogStore;
    pub use super::port_broker::{PortAllocationError, PortBroker, PortLease};
    pub use super::registry::{ExecutionHandle, Registry, RegistryError};
    pub use super::repository::{
        NamedRepositories, RepositoryConnection, RepositoryConnector, RepositoryError,
    };
    pub use super::sequence::{SequenceError, SequenceStore};
    pub use super::status::{is_reportable, job_status, pipeline_status};
    pub use super::{JobRegistry, PipelineRegistry};

    pub use sluice_protocol::prelude::*;
}
