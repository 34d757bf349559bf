use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use sluice_core::prelude::*;
use tracing::{info, warn};

use crate::{error::ApiError, ApiContextRef};

pub fn router() -> Router<ApiContextRef> {
    Router::new()
        .route("/slaves", get(list_slaves))
        .route("/slaves/register", post(register_slave))
        .route("/ports/allocate", get(allocate_port))
        .route("/ports/release/{run_id}", get(release_ports))
        .route("/sequence/{name}", get(next_sequence_value))
}

#[derive(Debug, Deserialize)]
struct SequenceQuery {
    #[serde(default = "default_increment")]
    increment: i64,
}

fn default_increment() -> i64 {
    1
}

async fn list_slaves(State(context): State<ApiContextRef>) -> Json<Vec<SlaveDetection>> {
    Json(context.peers.list())
}

/// Only a master keeps track of slaves; anyone else answers with an error result
async fn register_slave(
    State(context): State<ApiContextRef>,
    Json(node): Json<PeerNode>,
) -> Json<WebResult> {
    if !context.config.node.master {
        warn!(peer = %node, "Slave registration sent to a node that is not a master");
        return Json(WebResult::error(format!(
            "node '{}' is not a master",
            context.config.node.name
        )));
    }

    let name = node.name.clone();
    context.peers.register(node, Utc::now());
    Json(WebResult::ok_with_id("slave registered", name))
}

/// The broker probes ports with blocking socket binds while holding its lock
async fn allocate_port(
    State(context): State<ApiContextRef>,
    Query(request): Query<PortAllocationRequest>,
) -> Result<Json<PortAllocation>, ApiError> {
    let port = tokio::task::spawn_blocking(move || context.broker.allocate(&request))
        .await
        .map_err(|e| ApiError::Internal(format!("port allocation task failed: {e}")))??;

    Ok(Json(PortAllocation { port }))
}

async fn release_ports(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Json<WebResult> {
    let released = context.broker.release_run(&run_id);
    info!(run_id = %run_id, released, "Released ports on request");

    Json(WebResult::ok_with_id(
        format!("{released} port(s) released"),
        run_id,
    ))
}

async fn next_sequence_value(
    State(context): State<ApiContextRef>,
    Path(name): Path<String>,
    Query(query): Query<SequenceQuery>,
) -> Result<Json<SequenceValue>, ApiError> {
    let value = context.sequences.next_value(&name, query.increment)?;

    Ok(Json(SequenceValue {
        name,
        value,
        increment: query.increment,
    }))
}
