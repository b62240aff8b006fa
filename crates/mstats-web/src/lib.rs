//! HTTP receiver for object-change notifications.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mstats_core::ObjectNotification;
use mstats_ingest::{pipeline_from_config, IngestConfig, IngestError, IngestPipeline};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "mstats-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(pipeline: IngestPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/events/object", post(object_event_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("MSTATS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let pipeline = pipeline_from_config(&IngestConfig::from_env()).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for object notifications");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

/// Non-2xx makes the push delivery retry the notification.
pub fn status_for(err: &IngestError) -> StatusCode {
    match err {
        IngestError::MissingReportDate { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::SourceUnavailable(_) => StatusCode::BAD_GATEWAY,
        IngestError::WriteFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn object_event_handler(
    State(state): State<AppState>,
    Json(event): Json<ObjectNotification>,
) -> Response {
    match state.pipeline.ingest(&event).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => (status_for(&err), Json(json!({ "error": err.to_string() }))).into_response(),
    }
}
