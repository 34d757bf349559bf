use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, warn};

use crate::{error::ApiError, ApiContextRef};

/// `user:password` from a basic `Authorization` header value
fn basic_credentials(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Middleware function for HTTP basic authentication
pub async fn require_basic_auth(
    State(context): State<ApiContextRef>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let credentials = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(basic_credentials);

    if let Some((username, password)) = credentials {
        if username == context.config.username && password == context.config.password {
            debug!(user = %username, "Basic authentication successful");
            return Ok(next.run(req).await);
        }
    }

    warn!(uri = %req.uri(), "Authentication failed: No valid credentials provided");
    Err(ApiError::AuthenticationFailed)
}
