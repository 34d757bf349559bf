//! Lifecycle verbs shared by the pipeline and job families.
//!
//! Engine failures on a known run id never escape as errors here: they are
//! logged and embedded in the returned [`ExecutionStatus`]. The only error a
//! caller gets for a lifecycle verb is a missing run id.

use std::sync::Arc;

use sluice_core::{
    prelude::*,
    repository::release_on_completion,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{error::ApiError, ApiContext};

mod family;
pub mod pipeline;

pub use family::{Family, Jobs, Pipelines};

async fn connect_repository<F: Family>(
    context: &ApiContext,
    config: &F::Config,
) -> Result<Option<Arc<dyn RepositoryConnection>>, RepositoryError> {
    match F::repository(config) {
        Some(reference) => context.repositories.connect(reference).await.map(Some),
        None => Ok(None),
    }
}

/// Connect the referenced repository and build an execution object from a configuration
async fn build<F: Family>(
    context: &ApiContext,
    config: &F::Config,
) -> Result<Arc<F::Object>, EngineError> {
    let repository = connect_repository::<F>(context, config).await?;

    match F::build(context, config, repository.clone()) {
        Ok(object) => {
            if let Some(connection) = repository {
                release_on_completion(connection, object.completion());
            }
            Ok(object)
        }
        Err(e) => {
            if let Some(connection) = repository {
                connection.disconnect().await;
            }
            Err(e)
        }
    }
}

/// Status of an object after a lifecycle verb, carrying the verb's error if it failed
fn outcome<F: Family>(
    run_id: &str,
    object: &F::Object,
    verb: &'static str,
    result: Result<(), EngineError>,
) -> ExecutionStatus {
    let status = F::snapshot(run_id, object);

    match result {
        Ok(()) => {
            info!(kind = %F::KIND, run_id = %run_id, verb, state = %status.state, "Applied lifecycle verb");
            status
        }
        Err(e) => {
            warn!(kind = %F::KIND, run_id = %run_id, verb, error = %e, "Lifecycle verb failed");
            status.with_error(e.to_string())
        }
    }
}

pub fn list<F: Family>(context: &ApiContext) -> Vec<RunEntry> {
    F::registry(context).list()
}

/// Status of every registered execution. Entries removed meanwhile are skipped.
pub fn list_detailed<F: Family>(context: &ApiContext) -> Vec<ExecutionStatus> {
    let registry = F::registry(context);

    registry
        .list()
        .into_iter()
        .filter_map(|entry| registry.get(&entry.run_id).ok())
        .map(|handle| F::snapshot(&handle.entry.run_id, &*handle.object))
        .collect()
}

/// Build and register a new execution, returning its initial status
pub async fn submit<F: Family>(
    context: &ApiContext,
    config: F::Config,
) -> Result<ExecutionStatus, ApiError> {
    let name = F::name(&config).to_string();
    let object = build::<F>(context, &config).await?;

    let run_id = Uuid::new_v4().to_string();
    F::registry(context).add(&name, &run_id, Arc::clone(&object), config)?;

    info!(kind = %F::KIND, run_id = %run_id, name = %name, "Submitted execution");
    Ok(F::snapshot(&run_id, &*object))
}

/// Start an execution.
///
/// A finished execution is restarted: a new object is built from the stored
/// configuration and swapped in under the same run id. The swap happens in
/// the critical section of the run id, so concurrent starts build at most
/// one new object; the others notice the generation changed and return.
pub async fn start<F: Family>(
    context: &ApiContext,
    run_id: &str,
) -> Result<ExecutionStatus, ApiError> {
    let registry = F::registry(context);
    let observed = registry.get(run_id)?;

    let guard = registry.lock_run(run_id).await?;
    let handle = registry.get(run_id)?;

    if handle.generation != observed.generation {
        debug!(kind = %F::KIND, run_id = %run_id, generation = handle.generation, "Execution was restarted concurrently");
        return Ok(F::snapshot(run_id, &*handle.object));
    }

    let state = handle.object.state();
    if state.is_active() {
        warn!(kind = %F::KIND, run_id = %run_id, %state, "Start requested for an active execution");
        return Ok(F::snapshot(run_id, &*handle.object));
    }

    let (object, guard) = if state.is_terminal() {
        info!(kind = %F::KIND, run_id = %run_id, previous_state = %state, "Restarting execution from its stored configuration");

        let object = match build::<F>(context, &handle.config).await {
            Ok(object) => object,
            Err(e) => {
                error!(kind = %F::KIND, run_id = %run_id, error = %e, "Unable to rebuild execution");
                return Ok(F::snapshot(run_id, &*handle.object).with_error(e.to_string()));
            }
        };

        context.log_store.discard(handle.object.log_channel_id());
        let generation =
            registry.replace(&handle.entry, Arc::clone(&object), Arc::clone(&handle.config))?;
        debug!(kind = %F::KIND, run_id = %run_id, generation, "Swapped in rebuilt execution");

        drop(guard);
        (object, None)
    } else {
        (Arc::clone(&handle.object), Some(guard))
    };

    let started = object.start().await;
    drop(guard);

    match started {
        Err(EngineError::IllegalTransition { from, .. }) if from.is_active() => {
            debug!(kind = %F::KIND, run_id = %run_id, state = %from, "Execution was started concurrently");
            Ok(F::snapshot(run_id, &*object))
        }
        result => Ok(outcome::<F>(run_id, &*object, "start", result)),
    }
}

/// Signal an execution to halt. Returns once the signal is issued.
pub async fn stop<F: Family>(
    context: &ApiContext,
    run_id: &str,
) -> Result<ExecutionStatus, ApiError> {
    let handle = F::registry(context).get(run_id)?;
    let result = handle.object.stop().await;

    Ok(outcome::<F>(run_id, &*handle.object, "stop", result))
}

/// Status snapshot, with the log lines from `from_line` onward when asked for
pub fn status<F: Family>(
    context: &ApiContext,
    run_id: &str,
    from_line: Option<u64>,
) -> Result<ExecutionStatus, ApiError> {
    let handle = F::registry(context).get(run_id)?;
    let status = F::snapshot(run_id, &*handle.object);

    Ok(match from_line {
        Some(from) => status.with_log(
            context
                .log_store
                .lines_from(handle.object.log_channel_id(), from),
        ),
        None => status,
    })
}

/// Buffered log lines from `from_line` onward as plain text
pub fn log<F: Family>(
    context: &ApiContext,
    run_id: &str,
    from_line: u64,
) -> Result<String, ApiError> {
    let handle = F::registry(context).get(run_id)?;

    Ok(context
        .log_store
        .lines_from(handle.object.log_channel_id(), from_line)
        .text())
}

/// Discard the buffered log of an execution and remove it.
///
/// An active execution is stopped first. Removing a missing run id is a
/// not-found error, never a server fault.
pub async fn remove<F: Family>(context: &ApiContext, run_id: &str) -> Result<WebResult, ApiError> {
    let registry = F::registry(context);
    let _guard = registry.lock_run(run_id).await?;
    let handle = registry.get(run_id)?;

    Ok(remove_locked::<F>(context, handle).await)
}

/// Remove a run only while it is still the terminal object of `generation`.
///
/// Returns `None` when the run was restarted, is active again or is gone.
pub async fn remove_expired<F: Family>(
    context: &ApiContext,
    run_id: &str,
    generation: u64,
) -> Option<WebResult> {
    let registry = F::registry(context);
    let _guard = registry.lock_run(run_id).await.ok()?;
    let handle = registry.get(run_id).ok()?;

    let state = handle.object.state();
    if handle.generation != generation || !state.is_terminal() {
        debug!(kind = %F::KIND, run_id = %run_id, generation = handle.generation, %state, "Execution changed since it expired, keeping it");
        return None;
    }

    Some(remove_locked::<F>(context, handle).await)
}

/// Caller holds the run lock
async fn remove_locked<F: Family>(
    context: &ApiContext,
    handle: ExecutionHandle<F::Object, F::Config>,
) -> WebResult {
    let run_id = handle.entry.run_id.as_str();

    if handle.object.state().is_active() {
        info!(kind = %F::KIND, run_id = %run_id, "Stopping execution before removal");
        if let Err(e) = handle.object.stop().await {
            warn!(kind = %F::KIND, run_id = %run_id, error = %e, "Unable to stop execution before removal");
        }
    }

    context.log_store.discard(handle.object.log_channel_id());
    F::registry(context).remove(&handle.entry);
    F::release(context, run_id);

    info!(kind = %F::KIND, run_id = %run_id, name = %handle.entry.name, "Removed execution");
    WebResult::ok_with_id(
        format!("{} '{}' removed", F::KIND, handle.entry.name),
        run_id,
    )
}

/// Number of executions per lifecycle state, states without executions left out
pub fn state_counts<F: Family>(context: &ApiContext) -> Vec<StateCount> {
    use LifecycleState::*;

    let states: Vec<LifecycleState> = list_detailed::<F>(context)
        .into_iter()
        .map(|status| status.state)
        .collect();

    [
        Waiting,
        Preparing,
        Initialized,
        Running,
        Paused,
        Halting,
        Finished,
        FinishedWithErrors,
        Stopped,
        Errored,
    ]
    .into_iter()
    .map(|state| StateCount {
        state,
        count: states.iter().filter(|s| **s == state).count(),
    })
    .filter(|count| count.count > 0)
    .collect()
}

#[cfg(test)]
pub(crate) mod tests;
