//! Verbs only pipelines support

use sluice_core::prelude::*;
use tracing::info;

use super::{outcome, Family, Pipelines};
use crate::{error::ApiError, ApiContext};

/// Apply the stored configuration and move to `Initialized` without running
pub async fn prepare(context: &ApiContext, run_id: &str) -> Result<ExecutionStatus, ApiError> {
    let handle = Pipelines::registry(context).get(run_id)?;
    let result = handle.object.prepare(&handle.config.configuration).await;

    Ok(outcome::<Pipelines>(run_id, &*handle.object, "prepare", result))
}

pub async fn pause(context: &ApiContext, run_id: &str) -> Result<ExecutionStatus, ApiError> {
    let handle = Pipelines::registry(context).get(run_id)?;
    let result = handle.object.pause().await;

    Ok(outcome::<Pipelines>(run_id, &*handle.object, "pause", result))
}

pub async fn resume(context: &ApiContext, run_id: &str) -> Result<ExecutionStatus, ApiError> {
    let handle = Pipelines::registry(context).get(run_id)?;
    let result = handle.object.resume().await;

    Ok(outcome::<Pipelines>(run_id, &*handle.object, "resume", result))
}

/// Release the step resources and cluster ports of a run, or only its ports with `sockets_only`
pub async fn cleanup(
    context: &ApiContext,
    run_id: &str,
    sockets_only: bool,
) -> Result<ExecutionStatus, ApiError> {
    let handle = Pipelines::registry(context).get(run_id)?;

    let result = if sockets_only {
        Ok(())
    } else {
        handle.object.cleanup().await
    };
    if result.is_ok() {
        let released = context.broker.release_run(run_id);
        info!(run_id = %run_id, released, "Released cluster ports of pipeline");
    }

    Ok(outcome::<Pipelines>(run_id, &*handle.object, "cleanup", result))
}

/// The most recent rows seen by a step copy
pub fn sniff(
    context: &ApiContext,
    run_id: &str,
    request: &SniffRequest,
) -> Result<RowSample, ApiError> {
    let handle = Pipelines::registry(context).get(run_id)?;

    Ok(handle
        .object
        .sniff(&request.step, request.copy, request.kind, request.lines)?)
}
