use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use crate::ApiContextRef;

mod auth;
mod cluster;
mod health;
mod job;
mod pipeline;
mod server;

pub fn router(context: ApiContextRef) -> Router<ApiContextRef> {
    let public_routes = Router::new().nest("/api/health", health::router());

    let control_routes = Router::new()
        .route("/status", get(server::status))
        .route("/properties", get(server::properties))
        .nest("/pipeline", pipeline::router())
        .nest("/job", job::router())
        .nest("/cluster", cluster::router());

    let protected_routes = Router::new().nest("/control", control_routes).layer(
        axum::middleware::from_fn_with_state(context, auth::require_basic_auth),
    );

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::ERROR)))
}

/// The complete application with its state applied
pub fn app(context: ApiContextRef) -> Router {
    router(Arc::clone(&context)).with_state(context)
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::{
        body::Body,
        http::{header, Method, Request},
        response::Response,
    };
    use base64::{engine::general_purpose::STANDARD, Engine};
    use http_body_util::BodyExt;

    pub const USERNAME: &str = "cluster";
    pub const PASSWORD: &str = "secret";

    // Helper function to create an authenticated request
    pub fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let credentials = STANDARD.encode(format!("{USERNAME}:{PASSWORD}"));
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Basic {credentials}"));

        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    pub fn get(uri: &str) -> Request<Body> {
        request(Method::GET, uri, None)
    }

    pub async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    // Helper function to extract JSON from a response
    pub async fn json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    pub async fn text(response: Response) -> String {
        String::from_utf8(body_bytes(response).await).unwrap()
    }
}
