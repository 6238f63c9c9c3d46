use crate::config::Config;
use crate::metrics::Metrics;
use crate::snapshot::SnapshotStore;
use crate::supervisor::{ControlError, Supervisor};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub snapshots: SnapshotStore,
    pub supervisor: Arc<Supervisor>,
    pub config_path: Arc<PathBuf>,
}

/// JSON error body with the status code the failure maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let status = match err {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::AlreadyRunning(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(json!({ "status": "ok" })))
}

pub fn build_router(
    metrics: Arc<Metrics>,
    snapshots: SnapshotStore,
    supervisor: Arc<Supervisor>,
    config_path: PathBuf,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/workloads/:name/path", get(path_handler))
        .route("/api/workloads/:name/start", post(start_handler))
        .route("/api/workloads/:name/stop", post(stop_handler))
        .route("/api/workloads/:name/restart", post(restart_handler))
        .route("/api/restart-all", post(restart_all_handler))
        .route("/api/stop-all", post(stop_all_handler))
        .route("/api/config/reload", post(reload_handler))
        .with_state(HttpAppState {
            metrics,
            snapshots,
            supervisor,
            config_path: Arc::new(config_path),
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    state.metrics.refresh_uptime();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let snapshot = state.snapshots.borrow().clone();
    Json(snapshot)
}

async fn path_handler(State(state): State<HttpAppState>, Path(name): Path<String>) -> ApiResult {
    let path = state.supervisor.configured_path(&name).await?;
    Ok(Json(json!({ "name": name, "path": path })))
}

async fn start_handler(State(state): State<HttpAppState>, Path(name): Path<String>) -> ApiResult {
    state.supervisor.start(&name).await?;
    ok()
}

async fn stop_handler(State(state): State<HttpAppState>, Path(name): Path<String>) -> ApiResult {
    state.supervisor.stop(&name).await?;
    ok()
}

async fn restart_handler(State(state): State<HttpAppState>, Path(name): Path<String>) -> ApiResult {
    state.supervisor.restart(&name).await?;
    ok()
}

async fn restart_all_handler(State(state): State<HttpAppState>) -> ApiResult {
    state.supervisor.restart_all().await?;
    ok()
}

async fn stop_all_handler(State(state): State<HttpAppState>) -> ApiResult {
    state.supervisor.stop_all().await?;
    ok()
}

async fn reload_handler(State(state): State<HttpAppState>) -> ApiResult {
    let config = Config::load_from_file(state.config_path.as_path()).map_err(|err| {
        warn!(error = %err, "config reload rejected");
        ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
    })?;
    let workloads = config.workloads.len();
    state.supervisor.update_config(config).await;
    info!(workloads, path = %state.config_path.display(), "config reloaded");
    Ok(Json(json!({ "status": "ok", "workloads": workloads })))
}
