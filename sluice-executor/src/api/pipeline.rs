use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use sluice_core::prelude::*;

use crate::{
    control::{self, pipeline, Pipelines},
    error::ApiError,
    ApiContextRef,
};

pub fn router() -> Router<ApiContextRef> {
    Router::new()
        .route("/", get(list))
        .route("/detailed", get(list_detailed))
        .route("/add", put(add))
        .route("/prepare/{run_id}", get(prepare))
        .route("/start/{run_id}", get(start))
        .route("/stop/{run_id}", get(stop))
        .route("/pause/{run_id}", get(pause))
        .route("/resume/{run_id}", get(resume))
        .route("/cleanup/{run_id}", get(cleanup))
        .route("/status/{run_id}", get(status))
        .route("/log/{run_id}", get(log))
        .route("/log/{run_id}/{from}", get(log_from))
        .route("/remove/{run_id}", get(remove))
        .route("/sniff/{run_id}", get(sniff))
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusQuery {
    pub from: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    #[serde(default)]
    sockets: bool,
}

async fn list(State(context): State<ApiContextRef>) -> Json<Vec<RunEntry>> {
    Json(control::list::<Pipelines>(&context))
}

async fn list_detailed(State(context): State<ApiContextRef>) -> Json<Vec<ExecutionStatus>> {
    Json(control::list_detailed::<Pipelines>(&context))
}

async fn add(
    State(context): State<ApiContextRef>,
    payload: Result<Json<PipelineConfiguration>, JsonRejection>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    let Json(configuration) =
        payload.map_err(|e| ApiError::InvalidConfiguration(e.body_text()))?;

    control::submit::<Pipelines>(&context, configuration)
        .await
        .map(Json)
}

async fn prepare(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    pipeline::prepare(&context, &run_id).await.map(Json)
}

async fn start(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    control::start::<Pipelines>(&context, &run_id).await.map(Json)
}

async fn stop(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    control::stop::<Pipelines>(&context, &run_id).await.map(Json)
}

async fn pause(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    pipeline::pause(&context, &run_id).await.map(Json)
}

async fn resume(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    pipeline::resume(&context, &run_id).await.map(Json)
}

async fn cleanup(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    pipeline::cleanup(&context, &run_id, query.sockets)
        .await
        .map(Json)
}

async fn status(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    control::status::<Pipelines>(&context, &run_id, query.from).map(Json)
}

async fn log(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<String, ApiError> {
    control::log::<Pipelines>(&context, &run_id, 0)
}

async fn log_from(
    State(context): State<ApiContextRef>,
    Path((run_id, from)): Path<(String, u64)>,
) -> Result<String, ApiError> {
    control::log::<Pipelines>(&context, &run_id, from)
}

async fn remove(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
) -> Result<Json<WebResult>, ApiError> {
    control::remove::<Pipelines>(&context, &run_id)
        .await
        .map(Json)
}

async fn sniff(
    State(context): State<ApiContextRef>,
    Path(run_id): Path<String>,
    Query(request): Query<SniffRequest>,
) -> Result<Json<RowSample>, ApiError> {
    pipeline::sniff(&context, &run_id, &request).map(Json)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::http::{Method, StatusCode};
    use futures::future::join_all;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::{
        api::{
            app,
            test_support::{get, json, request, text},
        },
        control::tests::{context, counting_context, slow_pipeline},
        ApiContext,
    };

    use super::*;

    async fn submit(app: &Router, body: serde_json::Value) -> ExecutionStatus {
        let response = app
            .clone()
            .oneshot(request(Method::PUT, "/control/pipeline/add", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        json(response).await
    }

    async fn call(app: &Router, uri: &str) -> ExecutionStatus {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        json(response).await
    }

    async fn wait_terminal(context: &ApiContext, run_id: &str) {
        let handle = context.pipelines.get(run_id).unwrap();
        let mut completion = handle.object.completion();
        tokio::time::timeout(
            Duration::from_secs(10),
            completion.wait_for(|state| state.is_terminal()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn submit_start_stop_remove() {
        let context = Arc::new(context());
        let app = app(Arc::clone(&context));

        let submitted = submit(&app, serde_json::to_value(slow_pipeline("P")).unwrap()).await;
        assert_eq!(submitted.name, "P");
        assert_eq!(submitted.state, LifecycleState::Waiting);
        assert!(submitted.error.is_none());
        let run_id = submitted.run_id;

        let started = call(&app, &format!("/control/pipeline/start/{run_id}")).await;
        assert_eq!(started.state, LifecycleState::Running);

        let running = call(&app, &format!("/control/pipeline/status/{run_id}")).await;
        assert_eq!(running.state, LifecycleState::Running);
        assert!(!running.steps.is_empty());

        call(&app, &format!("/control/pipeline/stop/{run_id}")).await;
        wait_terminal(&context, &run_id).await;
        let stopped = call(&app, &format!("/control/pipeline/status/{run_id}")).await;
        assert!(stopped.state.is_terminal());

        let removed = app
            .clone()
            .oneshot(get(&format!("/control/pipeline/remove/{run_id}")))
            .await
            .unwrap();
        let removed: WebResult = json(removed).await;
        assert!(removed.is_ok());
        assert_eq!(removed.id.as_deref(), Some(run_id.as_str()));

        let gone = app
            .clone()
            .oneshot(get(&format!("/control/pipeline/status/{run_id}")))
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_ids_are_distinct() {
        let context = Arc::new(context());
        let app = app(Arc::clone(&context));
        let body = serde_json::to_value(slow_pipeline("P")).unwrap();

        let first = submit(&app, body.clone()).await;
        let second = submit(&app, body).await;

        assert_ne!(first.run_id, second.run_id);
        let listed: Vec<RunEntry> = json(app.clone().oneshot(get("/control/pipeline")).await.unwrap()).await;
        assert_eq!(
            listed,
            vec![
                RunEntry::new("P".into(), first.run_id),
                RunEntry::new("P".into(), second.run_id)
            ]
        );
    }

    #[tokio::test]
    async fn removing_twice_is_not_found() {
        let context = Arc::new(context());
        let app = app(Arc::clone(&context));
        let run_id = submit(&app, serde_json::to_value(slow_pipeline("P")).unwrap())
            .await
            .run_id;
        let uri = format!("/control/pipeline/remove/{run_id}");

        let first = app.clone().oneshot(get(&uri)).await.unwrap();
        let second = app.clone().oneshot(get(&uri)).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = json(second).await;
        assert!(body["error"].as_str().unwrap().contains(&run_id));
    }

    #[tokio::test]
    async fn concurrent_restarts_build_one_object() {
        let (context, builds) = counting_context();
        let context = Arc::new(context);
        let app = app(Arc::clone(&context));

        let run_id = submit(&app, serde_json::to_value(slow_pipeline("P")).unwrap())
            .await
            .run_id;
        call(&app, &format!("/control/pipeline/start/{run_id}")).await;
        call(&app, &format!("/control/pipeline/stop/{run_id}")).await;
        wait_terminal(&context, &run_id).await;
        let old_channel = context
            .pipelines
            .get(&run_id)
            .unwrap()
            .object
            .log_channel_id()
            .to_string();
        assert!(!context.log_store.lines_from(&old_channel, 0).lines.is_empty());

        let uri = format!("/control/pipeline/start/{run_id}");
        let responses = join_all((0..8).map(|_| app.clone().oneshot(get(&uri)))).await;

        for response in responses {
            let response = response.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let status: ExecutionStatus = json(response).await;
            assert!(status.error.is_none(), "{:?}", status.error);
        }
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 2);

        let handle = context.pipelines.get(&run_id).unwrap();
        assert_eq!(handle.generation, 1);
        assert_ne!(handle.object.state(), LifecycleState::Waiting);
        assert!(context.log_store.lines_from(&old_channel, 0).lines.is_empty());

        call(&app, &format!("/control/pipeline/stop/{run_id}")).await;
    }

    #[tokio::test]
    async fn log_polling_returns_suffixes() {
        let context = Arc::new(context());
        let app = app(Arc::clone(&context));
        let body = json!({
            "definition": { "name": "P", "steps": [{ "name": "a", "rows": 2 }, { "name": "b", "rows": 2 }] },
            "configuration": { "log_level": "debug" }
        });
        let run_id = submit(&app, body).await.run_id;
        call(&app, &format!("/control/pipeline/start/{run_id}")).await;
        wait_terminal(&context, &run_id).await;

        let full = text(
            app.clone()
                .oneshot(get(&format!("/control/pipeline/log/{run_id}")))
                .await
                .unwrap(),
        )
        .await;
        let lines: Vec<&str> = full.lines().collect();
        assert!(lines.len() > 2);

        for k in 0..=lines.len() {
            let suffix = text(
                app.clone()
                    .oneshot(get(&format!("/control/pipeline/log/{run_id}/{k}")))
                    .await
                    .unwrap(),
            )
            .await;
            assert_eq!(suffix.lines().collect::<Vec<_>>(), lines[k..].to_vec());
        }

        let paged = call(&app, &format!("/control/pipeline/status/{run_id}?from=1")).await;
        let log = paged.log.unwrap();
        assert_eq!(log.first_line, 1);
        assert_eq!(log.last_line, lines.len() as u64);
        assert_eq!(log.lines, lines[1..].iter().map(|l| l.to_string()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let context = Arc::new(context());
        let app = app(Arc::clone(&context));
        let run_id = submit(&app, serde_json::to_value(slow_pipeline("P")).unwrap())
            .await
            .run_id;

        call(&app, &format!("/control/pipeline/prepare/{run_id}")).await;
        let prepared = call(&app, &format!("/control/pipeline/status/{run_id}")).await;
        assert_eq!(prepared.state, LifecycleState::Initialized);

        call(&app, &format!("/control/pipeline/start/{run_id}")).await;
        let paused = call(&app, &format!("/control/pipeline/pause/{run_id}")).await;
        assert_eq!(paused.state, LifecycleState::Paused);
        let resumed = call(&app, &format!("/control/pipeline/resume/{run_id}")).await;
        assert_eq!(resumed.state, LifecycleState::Running);

        call(&app, &format!("/control/pipeline/stop/{run_id}")).await;
    }

    #[tokio::test]
    async fn engine_errors_are_embedded_in_status() {
        let context = Arc::new(context());
        let app = app(Arc::clone(&context));
        let run_id = submit(&app, serde_json::to_value(slow_pipeline("P")).unwrap())
            .await
            .run_id;
        call(&app, &format!("/control/pipeline/start/{run_id}")).await;

        let cleanup = call(&app, &format!("/control/pipeline/cleanup/{run_id}")).await;
        let prepare = call(&app, &format!("/control/pipeline/prepare/{run_id}")).await;

        assert!(cleanup.error.unwrap().contains("clean up"));
        assert!(prepare.error.unwrap().contains("illegal lifecycle transition"));
        assert_eq!(prepare.state, LifecycleState::Running);

        call(&app, &format!("/control/pipeline/stop/{run_id}")).await;
    }

    #[tokio::test]
    async fn invalid_submissions_leave_no_entry() {
        let context = Arc::new(context());
        let app = app(Arc::clone(&context));

        for body in [
            json!({ "definition": { "name": "P", "steps": [] } }),
            json!({ "definition": { "name": "" } }),
            json!({ "not": "a pipeline" }),
        ] {
            let response = app
                .clone()
                .oneshot(request(Method::PUT, "/control/pipeline/add", Some(body)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        assert!(context.pipelines.is_empty());
    }

    #[tokio::test]
    async fn unknown_run_ids_are_not_found() {
        let app = app(Arc::new(context()));

        for verb in ["prepare", "start", "stop", "pause", "resume", "cleanup", "status", "log", "remove"] {
            let response = app
                .clone()
                .oneshot(get(&format!("/control/pipeline/{verb}/missing")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{verb}");
        }
    }

    #[tokio::test]
    async fn control_routes_require_credentials() {
        let app = app(Arc::new(context()));

        let anonymous = axum::http::Request::builder()
            .uri("/control/pipeline")
            .body(axum::body::Body::empty())
            .unwrap();
        let health = axum::http::Request::builder()
            .uri("/api/health")
            .body(axum::body::Body::empty())
            .unwrap();

        assert_eq!(
            app.clone().oneshot(anonymous).await.unwrap().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(app.oneshot(health).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sniff_running_step() {
        let context = Arc::new(context());
        let app = app(Arc::clone(&context));
        let run_id = submit(&app, serde_json::to_value(slow_pipeline("P")).unwrap())
            .await
            .run_id;
        call(&app, &format!("/control/pipeline/start/{run_id}")).await;

        let handle = context.pipelines.get(&run_id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.object.step_statuses().iter().all(|s| s.rows_written < 3) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let response = app
            .clone()
            .oneshot(get(&format!(
                "/control/pipeline/sniff/{run_id}?step=generate&lines=2&kind=output"
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let sample: RowSample = json(response).await;
        assert_eq!(sample.step_name, "generate");
        assert_eq!(sample.rows.len(), 2);

        let missing = app
            .clone()
            .oneshot(get(&format!("/control/pipeline/sniff/{run_id}?step=nope")))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        call(&app, &format!("/control/pipeline/stop/{run_id}")).await;
    }
}
