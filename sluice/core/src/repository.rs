//! Connections to the metadata repositories a submission may reference.
//!
//! A run that references a repository gets a connection when its
//! execution object is built. The connection is released once the run
//! reaches a terminal state, and re-established when the run is restarted.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use sluice_protocol::{configuration::RepositoryReference, status::LifecycleState};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("repository '{0}' is not configured on this node")]
    Unknown(String),

    #[error("failed to connect to repository '{name}': {message}")]
    Connect { name: String, message: String },
}

#[async_trait]
pub trait RepositoryConnection: Send + Sync {
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

#[async_trait]
pub trait RepositoryConnector: Send + Sync {
    async fn connect(
        &self,
        reference: &RepositoryReference,
    ) -> Result<Arc<dyn RepositoryConnection>, RepositoryError>;
}

/// Repositories known to this node by name, configured at startup
#[derive(Debug, Default, Clone)]
pub struct NamedRepositories {
    locations: BTreeMap<String, String>,
}

impl NamedRepositories {
    pub fn new(locations: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            locations: locations.into_iter().collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.locations.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[async_trait]
impl RepositoryConnector for NamedRepositories {
    async fn connect(
        &self,
        reference: &RepositoryReference,
    ) -> Result<Arc<dyn RepositoryConnection>, RepositoryError> {
        let location = self
            .locations
            .get(&reference.name)
            .ok_or_else(|| RepositoryError::Unknown(reference.name.clone()))?;

        if location.trim().is_empty() {
            return Err(RepositoryError::Connect {
                name: reference.name.clone(),
                message: "empty repository location".to_string(),
            });
        }

        info!(
            repository = %reference.name,
            location = %location,
            user = reference.username.as_deref().unwrap_or("-"),
            "Connected to repository"
        );

        Ok(Arc::new(NamedConnection {
            name: reference.name.clone(),
            connected: AtomicBool::new(true),
        }))
    }
}

struct NamedConnection {
    name: String,
    connected: AtomicBool,
}

#[async_trait]
impl RepositoryConnection for NamedConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!(repository = %self.name, "Disconnected from repository");
        }
    }
}

/// Disconnect once the observed run reaches a terminal state or its object is dropped
pub fn release_on_completion(
    connection: Arc<dyn RepositoryConnection>,
    mut completion: watch::Receiver<LifecycleState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reached = completion
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state);
        match reached {
            Ok(state) => {
                debug!(repository = %connection.name(), %state, "Run completed, releasing repository")
            }
            Err(_) => debug!(repository = %connection.name(), "Run dropped, releasing repository"),
        }
        connection.disconnect().await;
    })
}
