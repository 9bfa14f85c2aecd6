// Routes and Handlers
// Job routes live under /api (bearer-token checked when configured);
// /metrics and /health stay at the root for scrapers and probes.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use agentbus_core::CoreError;
use agentbus_events::EventFilter;
use agentbus_types::{ArtifactType, BusEvent, EventType, JobStatus};

use crate::AppState;

// ============================================================================
// Errors
// ============================================================================

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<agentbus_store::StoreError> for ApiError {
    fn from(err: agentbus_store::StoreError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self.0 {
            CoreError::InvalidInput(_) => (StatusCode::BAD_REQUEST, false),
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, false),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, false),
            CoreError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, true),
            CoreError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, false),
        };
        let body = Json(json!({ "error": self.0.to_string() }));
        let mut response = (status, body).into_response();
        if retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Router
// ============================================================================

pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/projects", post(create_project).get(list_projects))
        .route("/projects/{job_id}", get(get_project).delete(delete_project))
        .route("/projects/{job_id}/artifacts/{artifact_type}", get(get_artifact))
        .route("/projects/{job_id}/usage", get(get_usage))
        .route("/projects/{job_id}/approve", post(approve))
        .route("/projects/{job_id}/request_changes", post(request_changes))
        .route("/projects/{job_id}/restart", post(restart))
        .route("/projects/{job_id}/cancel", post(cancel))
        .route("/events/stream", get(events_stream))
        .route("/events/history", get(events_history))
        .route("/admin/requeue_orphaned", post(requeue_orphaned))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .nest("/api", api)
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

/// Single-process token check. Open when no token is configured.
async fn require_auth(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.orchestrator.config().http.auth_token.clone() else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid bearer token" })),
        )
            .into_response()
    }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateProjectInput {
    project_id: String,
    requirements: String,
    #[serde(default)]
    metadata: Value,
}

async fn create_project(
    State(state): State<AppState>,
    Json(input): Json<CreateProjectInput>,
) -> ApiResult<Response> {
    let metadata = if input.metadata.is_null() {
        json!({})
    } else {
        input.metadata
    };
    let job = state
        .orchestrator
        .create_job(&input.project_id, &input.requirements, metadata)
        .await?;

    // Dispatch outside the request so creation latency stays flat
    let orchestrator = state.orchestrator.clone();
    let job_id = job.job_id.clone();
    tokio::spawn(async move {
        if let Err(err) = orchestrator.start_job(&job_id).await {
            tracing::error!(job_id, error = %err, "job start failed");
        }
    });

    Ok((
        StatusCode::CREATED,
        Json(json!({ "job_id": job.job_id, "status": job.status })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    status: Option<String>,
}

async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            CoreError::InvalidInput(format!("unknown status filter '{raw}'"))
        })?),
        None => None,
    };
    let jobs = state
        .orchestrator
        .store()
        .list_jobs(query.limit.unwrap_or(50), status)
        .await?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn get_project(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state.orchestrator.store().get_job(&job_id).await?;
    Ok(Json(serde_json::to_value(job).unwrap_or_default()))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.delete(&job_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path((job_id, artifact_type)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let artifact_type = ArtifactType::parse(&artifact_type).ok_or_else(|| {
        CoreError::InvalidInput(format!("unknown artifact type '{artifact_type}'"))
    })?;
    let artifact = state
        .orchestrator
        .store()
        .get_latest_artifact(&job_id, artifact_type)
        .await?
        .ok_or_else(|| {
            CoreError::NotFound(format!("no {artifact_type} artifact for job {job_id}"))
        })?;
    Ok(Json(json!({
        "artifact_id": artifact.artifact_id,
        "artifact_type": artifact.artifact_type,
        "content": artifact.content,
        "created_at": artifact.created_at,
    })))
}

async fn get_usage(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    // 404 for unknown jobs, zeroes for jobs that spent nothing yet
    state.orchestrator.store().get_job(&job_id).await?;
    let usage = state.orchestrator.store().get_usage(&job_id).await?;
    Ok(Json(json!({
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
        "calls": usage.calls,
        "cost_usd": usage.cost_usd,
    })))
}

// ============================================================================
// Approvals and lifecycle
// ============================================================================

fn optional_field(body: &Bytes, field: &str) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get(field).and_then(Value::as_str).map(str::to_string))
}

async fn approve(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let notes = optional_field(&body, "notes");
    state.orchestrator.approve(&job_id, notes.as_deref()).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct RequestChangesInput {
    notes: String,
}

async fn request_changes(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(input): Json<RequestChangesInput>,
) -> ApiResult<Json<Value>> {
    state
        .orchestrator
        .request_changes(&job_id, &input.notes)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn restart(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.restart(&job_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let reason = optional_field(&body, "reason");
    state.orchestrator.cancel(&job_id, reason.as_deref()).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn requeue_orphaned(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let older_than_ms = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|value| value.get("older_than_ms").and_then(Value::as_u64))
    };
    let cutoff = Duration::from_millis(
        older_than_ms.unwrap_or(state.orchestrator.config().queue.visibility_timeout_ms),
    );
    let requeued = state.orchestrator.requeue_orphaned(cutoff).await?;
    Ok(Json(json!({ "requeued": requeued })))
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Deserialize)]
struct StreamQuery {
    job_id: Option<String>,
    last_event_id: Option<u64>,
}

fn sse_frame(event: &BusEvent) -> Event {
    Event::default()
        .id(event.event_id.to_string())
        .event(event.event_type.as_str())
        .data(serde_json::to_string(event).unwrap_or_default())
}

fn event_stream(
    state: AppState,
    filter: EventFilter,
    since: Option<u64>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let events = state.orchestrator.events();
    // Subscribe before snapshotting the replay so nothing is lost in
    // between; overlap is deduplicated by the id floor below.
    let subscription = events.subscribe(filter.clone());
    let replay = match since {
        Some(id) => events.replay_since(id, &filter),
        None => Vec::new(),
    };
    let floor = replay
        .last()
        .map(|event| event.event_id)
        .or(since)
        .unwrap_or(0);

    let live = stream::unfold(subscription, |mut subscription| async move {
        subscription.next().await.map(|event| (event, subscription))
    })
    .filter(move |event| {
        let keep = event.event_id > floor || event.event_type == EventType::DroppedEvent;
        async move { keep }
    });

    stream::iter(replay)
        .chain(live)
        .map(|event| Ok(sse_frame(&event)))
}

async fn events_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter = EventFilter {
        job_id: query.job_id,
    };
    let since = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .or(query.last_event_id);
    let heartbeat = Duration::from_millis(state.orchestrator.config().http.heartbeat_ms);
    Sse::new(event_stream(state, filter, since))
        .keep_alive(KeepAlive::new().interval(heartbeat))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    job_id: Option<String>,
    limit: Option<usize>,
}

async fn events_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let events = state
        .orchestrator
        .events()
        .history(query.job_id.as_deref(), query.limit.unwrap_or(100));
    Json(json!({ "events": events }))
}

// ============================================================================
// Observability
// ============================================================================

async fn metrics(State(state): State<AppState>) -> Response {
    let text = state
        .orchestrator
        .metrics()
        .render(state.orchestrator.queue());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    match state.orchestrator.store().list_jobs(1, None).await {
        Ok(_) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "error": err.to_string() })),
        )
            .into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use tower::ServiceExt;

    use agentbus_agents::DefaultClassifier;
    use agentbus_core::{EngineConfig, Orchestrator};
    use agentbus_events::{EventBus, EventBusConfig};
    use agentbus_queue::TaskQueue;
    use agentbus_store::JobStore;
    use agentbus_types::Stage;

    async fn test_state_with(config: EngineConfig) -> AppState {
        let store = Arc::new(JobStore::open_in_memory().await.unwrap());
        let queue = Arc::new(TaskQueue::new(Duration::from_secs(60)));
        let events = EventBus::new(EventBusConfig::default());
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            queue,
            events,
            config,
            Arc::new(DefaultClassifier),
        ));
        AppState { orchestrator }
    }

    async fn test_state() -> AppState {
        test_state_with(EngineConfig::default()).await
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn create_project_returns_queued_job() {
        let state = test_state().await;
        let app = app_router(state.clone());

        let (status, body) = post_json(
            &app,
            "/api/projects",
            json!({ "project_id": "p1", "requirements": "Build a notes app." }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "queued");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let (status, job) = get_json(&app, &format!("/api/projects/{job_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["project_id"], "p1");
    }

    #[tokio::test]
    async fn create_project_rejects_empty_requirements() {
        let state = test_state().await;
        let app = app_router(state);
        let (status, _) = post_json(
            &app,
            "/api/projects",
            json!({ "project_id": "p1", "requirements": "  " }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let state = test_state().await;
        let app = app_router(state);
        let (status, _) = get_json(&app, "/api/projects/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(&app, "/api/projects/nope/usage").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn approve_outside_gate_conflicts() {
        let state = test_state().await;
        let job = state
            .orchestrator
            .create_job("p1", "reqs", json!({}))
            .await
            .unwrap();
        let app = app_router(state);
        let (status, _) =
            post_json(&app, &format!("/api/projects/{}/approve", job.job_id), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn artifact_fetch_latest_wins() {
        let state = test_state().await;
        let job = state
            .orchestrator
            .create_job("p1", "reqs", json!({}))
            .await
            .unwrap();
        let app = app_router(state.clone());

        let (status, _) =
            get_json(&app, &format!("/api/projects/{}/artifacts/prd", job.job_id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            get_json(&app, &format!("/api/projects/{}/artifacts/bogus", job.job_id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        state
            .orchestrator
            .store()
            .upsert_artifact(&job.job_id, ArtifactType::Prd, "v1", json!({}))
            .await
            .unwrap();
        state
            .orchestrator
            .store()
            .upsert_artifact(&job.job_id, ArtifactType::Prd, "v2", json!({}))
            .await
            .unwrap();

        let (status, body) =
            get_json(&app, &format!("/api/projects/{}/artifacts/prd", job.job_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "v2");
        assert!(body["artifact_id"].is_string());
    }

    #[tokio::test]
    async fn cancel_then_delete_lifecycle() {
        let state = test_state().await;
        let job = state
            .orchestrator
            .create_job("p1", "reqs", json!({}))
            .await
            .unwrap();
        let app = app_router(state);
        let base = format!("/api/projects/{}", job.job_id);

        // Non-terminal delete is refused
        let request = Request::builder()
            .method("DELETE")
            .uri(&base)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let (status, _) = post_json(&app, &format!("{base}/cancel"), json!({"reason": "user"})).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post_json(&app, &format!("{base}/cancel"), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let request = Request::builder()
            .method("DELETE")
            .uri(&base)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, _) = get_json(&app, &base).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn restart_requires_terminal() {
        let state = test_state().await;
        let job = state
            .orchestrator
            .create_job("p1", "reqs", json!({}))
            .await
            .unwrap();
        let app = app_router(state.clone());
        let (status, _) =
            post_json(&app, &format!("/api/projects/{}/restart", job.job_id), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);

        state.orchestrator.cancel(&job.job_id, None).await.unwrap();
        let (status, _) =
            post_json(&app, &format!("/api/projects/{}/restart", job.job_id), json!({})).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn history_returns_job_events() {
        let state = test_state().await;
        let job = state
            .orchestrator
            .create_job("p1", "reqs", json!({}))
            .await
            .unwrap();
        let app = app_router(state);

        let (status, body) =
            get_json(&app, &format!("/api/events/history?job_id={}", job.job_id)).await;
        assert_eq!(status, StatusCode::OK);
        let events = body["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "job_created");
        assert_eq!(events[0]["stage"], Stage::Initialization.as_str());
    }

    #[tokio::test]
    async fn metrics_and_health() {
        let state = test_state().await;
        state
            .orchestrator
            .create_job("p1", "reqs", json!({}))
            .await
            .unwrap();
        let app = app_router(state);

        let request = Request::builder()
            .method("GET")
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(text.to_vec()).unwrap();
        assert!(text.contains("agentbus_jobs_created_total 1"));
        assert!(text.contains("agentbus_queue_depth{queue=\"cpu\"}"));

        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn bearer_token_guards_api_routes() {
        let mut config = EngineConfig::default();
        config.http.auth_token = Some("secret".to_string());
        let state = test_state_with(config).await;
        let app = app_router(state);

        let (status, _) = get_json(&app, "/api/projects").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("GET")
            .uri("/api/projects")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Probe surfaces stay open
        let (status, _) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn requeue_orphaned_defaults_to_visibility_window() {
        let state = test_state().await;
        let app = app_router(state);
        let (status, body) = post_json(&app, "/api/admin/requeue_orphaned", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requeued"], json!([]));
    }

    #[tokio::test]
    async fn list_projects_filters() {
        let state = test_state().await;
        let job = state
            .orchestrator
            .create_job("p1", "reqs", json!({}))
            .await
            .unwrap();
        state.orchestrator.cancel(&job.job_id, None).await.unwrap();
        state
            .orchestrator
            .create_job("p2", "reqs", json!({}))
            .await
            .unwrap();
        let app = app_router(state);

        let (status, body) = get_json(&app, "/api/projects?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 2);

        let (status, body) = get_json(&app, "/api/projects?status=cancelled").await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["project_id"], "p1");

        let (status, _) = get_json(&app, "/api/projects?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
