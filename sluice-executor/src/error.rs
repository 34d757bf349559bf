use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use sluice_core::prelude::{EngineError, PortAllocationError, RegistryError, SequenceError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("{0}")]
    NotFound(String),

    /// Submit payload that cannot be parsed or built
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    PortAllocationExhausted(#[from] PortAllocationError),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotFound(_) => ApiError::NotFound(error.to_string()),
            RegistryError::DuplicateRunId(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<SequenceError> for ApiError {
    fn from(error: SequenceError) -> Self {
        match error {
            SequenceError::Unknown(_) => ApiError::NotFound(error.to_string()),
            SequenceError::InvalidIncrement(_) => ApiError::InvalidRequest(error.to_string()),
            SequenceError::Overflow(_) => ApiError::Conflict(error.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::StepNotFound { .. } => ApiError::NotFound(error.to_string()),
            EngineError::InvalidDefinition(_) | EngineError::Repository(_) => {
                ApiError::InvalidConfiguration(error.to_string())
            }
            EngineError::IllegalTransition { .. } | EngineError::InvalidState { .. } => {
                ApiError::Conflict(error.to_string())
            }
            EngineError::Failed(_) => ApiError::Internal(error.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        let status = match &self {
            ApiError::AuthenticationFailed => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"sluice\""),
                );
                StatusCode::UNAUTHORIZED
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidConfiguration(_) | ApiError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PortAllocationExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error_response = ErrorResponse {
            error: self.to_string(),
        };
        let body = serde_json::to_string(&error_response)
            .unwrap_or_else(|_| format!("{{\"error\": \"{}\"}}", self));

        let mut response = Response::new(body.into());
        *response.status_mut() = status;

        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response.headers_mut().extend(headers);

        response
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use rstest::rstest;
    use sluice_core::prelude::LifecycleState;

    use super::*;

    #[rstest]
    #[case(ApiError::from(RegistryError::NotFound("r1".into())), StatusCode::NOT_FOUND)]
    #[case(ApiError::from(EngineError::InvalidDefinition("no steps".into())), StatusCode::BAD_REQUEST)]
    #[case(
        ApiError::from(EngineError::InvalidState { operation: "cleanup", state: LifecycleState::Running }),
        StatusCode::CONFLICT
    )]
    #[case(ApiError::from(SequenceError::InvalidIncrement(0)), StatusCode::BAD_REQUEST)]
    #[case(
        ApiError::from(PortAllocationError::Exhausted { hostname: "h".into(), range_start: 1, range_end: 2 }),
        StatusCode::SERVICE_UNAVAILABLE
    )]
    #[case(ApiError::AuthenticationFailed, StatusCode::UNAUTHORIZED)]
    #[tokio::test]
    async fn maps_to_status_with_json_body(#[case] error: ApiError, #[case] expected: StatusCode) {
        let message = error.to_string();
        let response = error.into_response();

        assert_eq!(response.status(), expected);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], message);
    }

    #[test]
    fn unauthorized_asks_for_basic_credentials() {
        let response = ApiError::AuthenticationFailed.into_response();

        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"sluice\""
        );
    }
}
