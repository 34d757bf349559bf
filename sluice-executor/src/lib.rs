//! # Sluice Executor
//!
//! A node of a sluice cluster. It hosts pipeline and job executions and
//! exposes their control plane over HTTP so a coordinator can submit,
//! start, pause, resume, stop, inspect and remove them remotely.
//!
//! ## Crate Organization
//!
//! - **api/**: axum routes, one module per resource family, plus basic auth
//! - **control/**: lifecycle verbs on top of the execution registries, including the restart flow
//! - **janitor.rs**: removal of expired executions, log trimming and peer expiry
//! - **registration.rs**: periodic registration of a slave with its masters
//! - **peers.rs**: slaves known to a master
//! - **config.rs**: node configuration
//! - **error.rs**: API error type and its HTTP mapping

use std::{sync::Arc, time::Instant};

use sluice_core::prelude::*;

pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod janitor;
pub mod peers;
pub mod registration;

pub use config::{Config, ConfigError};
pub use error::ApiError;

pub type ApiContextRef = Arc<ApiContext>;

/// Everything the control plane of one node works with, built once at startup
pub struct ApiContext {
    pub config: Config,
    pub pipelines: PipelineRegistry,
    pub jobs: JobRegistry,
    pub factory: Arc<dyn ExecutionFactory>,
    pub repositories: Arc<dyn RepositoryConnector>,
    pub log_store: Arc<LogStore>,
    pub broker: PortBroker,
    pub sequences: SequenceStore,
    pub peers: peers::PeerRegistry,
    pub started_at: Instant,
}

impl ApiContext {
    /// Context running executions on the in-process engine
    pub fn new(config: Config) -> Self {
        let log_store = Arc::new(LogStore::new(config.max_log_lines, config.log_retention));
        let factory = Arc::new(LocalEngine::new(Arc::clone(&log_store)));
        let repositories = Arc::new(NamedRepositories::new(config.repositories.clone()));

        Self::with_engine(config, factory, repositories, log_store)
    }

    pub fn with_engine(
        config: Config,
        factory: Arc<dyn ExecutionFactory>,
        repositories: Arc<dyn RepositoryConnector>,
        log_store: Arc<LogStore>,
    ) -> Self {
        Self {
            sequences: SequenceStore::new(config.sequence_auto_start),
            config,
            pipelines: PipelineRegistry::new(),
            jobs: JobRegistry::new(),
            factory,
            repositories,
            log_store,
            broker: PortBroker::new(),
            peers: peers::PeerRegistry::new(),
            started_at: Instant::now(),
        }
    }
}
