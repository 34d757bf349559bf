use axum::{extract::State, Json};
use sluice_protocol::cluster::{NodeProperties, ServerStatus};

use crate::{
    control::{self, Jobs, Pipelines},
    ApiContextRef,
};

/// Node name, role, uptime and executions per lifecycle state
pub async fn status(State(context): State<ApiContextRef>) -> Json<ServerStatus> {
    Json(ServerStatus {
        name: context.config.node.name.clone(),
        master: context.config.node.master,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: context.started_at.elapsed().as_secs(),
        pipelines: control::state_counts::<Pipelines>(&context),
        jobs: control::state_counts::<Jobs>(&context),
    })
}

pub async fn properties(State(context): State<ApiContextRef>) -> Json<NodeProperties> {
    Json(context.config.properties.clone())
}
