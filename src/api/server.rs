use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::analytics::{
    AnalyzeRequest, ModelUpdate, Pipeline, PipelineError, RegistryError, StartRequest,
};

use super::ws;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Serialize)]
struct StartResponse {
    status: &'static str,
    models: Vec<String>,
}

#[derive(Serialize)]
struct StatusOnly {
    status: &'static str,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    job_id: String,
    status: &'static str,
}

#[derive(Serialize)]
struct ClassState {
    model: String,
    class: String,
    enabled: bool,
}

#[derive(Serialize)]
struct SnapshotResponse {
    path: String,
}

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    path: PathBuf,
    labels: Option<Vec<String>>,
    enabled_classes: Option<BTreeMap<String, bool>>,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(ErrorBody { detail: self.to_string() })).into_response()
    }
}

fn malformed(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            detail: rejection.body_text(),
        }),
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/detector/start", post(start_handler))
        .route("/detector/stop", post(stop_handler))
        .route("/detector/status", get(status_handler))
        .route("/detector/analyze-file", post(analyze_handler))
        .route("/detector/models", get(list_models_handler).post(register_model_handler))
        .route(
            "/detector/models/{name}",
            get(get_model_handler).patch(update_model_handler),
        )
        .route("/detector/models/{name}/classes/{class}", get(class_state_handler))
        .route("/detector/classes", get(classes_handler))
        .route("/detector/snapshot", post(snapshot_handler))
        .route("/ws/detections", get(ws::detections_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!("starting HTTP server on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        })
        .await
}

async fn index_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn start_handler(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed(rejection),
    };

    match state.pipeline.start(request).await {
        Ok(models) => Json(StartResponse {
            status: "started",
            models,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stop_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.pipeline.stop().await;
    Json(StatusOnly { status: "stopped" })
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.status().await)
}

async fn analyze_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed(rejection),
    };

    match state.pipeline.analyze(request).await {
        Ok(job_id) => Json(AnalyzeResponse {
            job_id,
            status: "processing",
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_models_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.registry().list())
}

async fn get_model_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.pipeline.registry().get(&name) {
        Some(entry) => Json(entry).into_response(),
        None => PipelineError::from(RegistryError::NotFound(name)).into_response(),
    }
}

async fn class_state_handler(
    State(state): State<AppState>,
    Path((model, class)): Path<(String, String)>,
) -> impl IntoResponse {
    let enabled = state.pipeline.registry().is_class_enabled(&model, &class);
    Json(ClassState {
        model,
        class,
        enabled,
    })
}

/// Union of labels across every registered model.
async fn classes_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.registry().all_classes())
}

async fn register_model_handler(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed(rejection),
    };

    match state
        .pipeline
        .registry()
        .register(&req.name, &req.kind, &req.path, req.labels, req.enabled_classes)
    {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(e) => PipelineError::from(e).into_response(),
    }
}

async fn update_model_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<ModelUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed(rejection),
    };

    match state.pipeline.update_model(&name, &update) {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn snapshot_handler(State(state): State<AppState>) -> Response {
    match state.pipeline.snapshot().await {
        Ok(path) => Json(SnapshotResponse {
            path: path.display().to_string(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}
