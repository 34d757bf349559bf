use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::ApiContextRef;

pub fn router() -> Router<ApiContextRef> {
    Router::new().route("/", get(health_check))
}

#[derive(Serialize)]
struct HealthCheckResponse {
    status: &'static str,
    node: String,
    version: &'static str,
}

async fn health_check(State(context): State<ApiContextRef>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "OK",
        node: context.config.node.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
