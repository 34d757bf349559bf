use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use sluice_protocol::{
    configuration::{ExecutionConfiguration, ExecutionResult, LogLevel},
    definition::JobDefinition,
    status::LifecycleState,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use super::{
    lifecycle::{Lifecycle, RunLog},
    lock,
};
use crate::{
    execution::{EngineError, Execution},
    log_store::LogStore,
    repository::RepositoryConnection,
};

struct Shared {
    definition: JobDefinition,
    configuration: ExecutionConfiguration,
    lifecycle: Lifecycle,
    log: RunLog,
    cancel: CancellationToken,
    error: Mutex<Option<String>>,
    result: Mutex<Option<ExecutionResult>>,
    repository: Option<Arc<dyn RepositoryConnection>>,
    control: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn run(&self) {
        let mut errors = 0;
        let mut failure = None;

        for entry in &self.definition.entries {
            self.log
                .write(LogLevel::Basic, format!("Starting entry '{}'", entry.name));

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(entry.duration_ms)) => {}
            }

            if entry.fail {
                errors += 1;
                let message = format!("entry '{}' failed", entry.name);
                self.log.write(LogLevel::Error, &message);
                failure = Some(message);
                break;
            }
            self.log
                .write(LogLevel::Detailed, format!("Finished entry '{}'", entry.name));
        }

        let _control = self.control.lock().await;
        let final_state = if self.cancel.is_cancelled() {
            LifecycleState::Stopped
        } else if failure.is_some() {
            LifecycleState::FinishedWithErrors
        } else {
            LifecycleState::Finished
        };

        *lock(&self.error) = failure;
        *lock(&self.result) = Some(ExecutionResult {
            success: final_state == LifecycleState::Finished,
            errors,
            exit_status: if final_state == LifecycleState::Finished {
                0
            } else {
                1
            },
            ..Default::default()
        });

        // observers of the terminal state see the closing line
        self.log.write(
            LogLevel::Minimal,
            format!("Job '{}' ended: {final_state}", self.definition.name),
        );
        match self.lifecycle.transition(final_state) {
            Ok(_) => info!(state = %final_state, "Job run ended"),
            Err(e) => error!(error = %e, "Failed to record job completion"),
        }
    }
}

/// A job running its entries one after another on the local tokio runtime
pub struct LocalJob {
    shared: Arc<Shared>,
}

impl LocalJob {
    pub(crate) fn new(
        definition: JobDefinition,
        configuration: ExecutionConfiguration,
        log_store: Arc<LogStore>,
        log_channel_id: String,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Self {
        let log = RunLog::new(log_store, log_channel_id, configuration.log_level);

        Self {
            shared: Arc::new(Shared {
                definition,
                configuration,
                lifecycle: Lifecycle::new(),
                log,
                cancel: CancellationToken::new(),
                error: Mutex::new(None),
                result: Mutex::new(None),
                repository,
                control: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

#[async_trait]
impl Execution for LocalJob {
    fn name(&self) -> &str {
        &self.shared.definition.name
    }

    fn log_channel_id(&self) -> &str {
        self.shared.log.channel()
    }

    fn state(&self) -> LifecycleState {
        self.shared.lifecycle.current()
    }

    fn error(&self) -> Option<String> {
        lock(&self.shared.error).clone()
    }

    fn result(&self) -> Option<ExecutionResult> {
        lock(&self.shared.result).clone()
    }

    async fn start(&self) -> Result<(), EngineError> {
        let _control = self.shared.control.lock().await;
        self.shared.lifecycle.transition(LifecycleState::Running)?;

        let shared = &self.shared;
        shared.log.write(
            LogLevel::Basic,
            format!(
                "Starting job '{}' with {} entries",
                shared.definition.name,
                shared.definition.entries.len()
            ),
        );
        if let Some(repository) = &shared.repository {
            shared.log.write(
                LogLevel::Detailed,
                format!("Using repository '{}'", repository.name()),
            );
        }
        if let Some(previous) = &shared.configuration.previous_result {
            shared.log.write(
                LogLevel::Detailed,
                format!(
                    "Previous result: success={}, errors={}",
                    previous.success, previous.errors
                ),
            );
        }

        let span = info_span!("job", name = %shared.definition.name, log_channel = %shared.log.channel());
        let shared = Arc::clone(shared);
        tokio::spawn(async move { shared.run().await }.instrument(span));
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let _control = self.shared.control.lock().await;

        match self.shared.lifecycle.current() {
            LifecycleState::Running => {
                self.shared.lifecycle.transition(LifecycleState::Halting)?;
                self.shared.cancel.cancel();
                self.shared.log.write(LogLevel::Basic, "Stopping job");
            }
            LifecycleState::Waiting => {
                self.shared.lifecycle.transition(LifecycleState::Stopped)?;
            }
            state => debug!(%state, "Stop requested for job that is not running"),
        }
        Ok(())
    }

    fn completion(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }
}
