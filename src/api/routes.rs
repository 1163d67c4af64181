use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::api::facade::CloudApi;
use crate::core::error::FleetError;

pub fn create_router(api: CloudApi) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/instances", get(list_handler))
        .route("/api/instances/:name", get(instance_handler))
        .route("/api/instances/:name/restart", post(restart_handler))
        .route("/api/groups", get(groups_handler))
        .route("/api/reconcile", post(reconcile_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(api)
}

struct ApiError(FleetError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::NotFound(_) | FleetError::UnknownGroup(_) => StatusCode::NOT_FOUND,
            FleetError::RuntimeUnavailable(_) | FleetError::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::ResourceExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(event = "API_REQUEST_FAILED", status = status.as_u16(), error = %self.0, "Facade request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn list_handler(State(api): State<CloudApi>) -> Json<Vec<String>> {
    Json(api.list_running_instance_names().await)
}

async fn instance_handler(State(api): State<CloudApi>, Path(name): Path<String>) -> Response {
    match api.instance(&name).await {
        Some(instance) => Json(instance).into_response(),
        None => ApiError(FleetError::NotFound(name)).into_response(),
    }
}

async fn restart_handler(State(api): State<CloudApi>, Path(name): Path<String>) -> Response {
    match api.restart(&name).await {
        Ok(instance) => Json(instance).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn groups_handler(State(api): State<CloudApi>) -> impl IntoResponse {
    Json(api.groups().await)
}

async fn reconcile_handler(State(api): State<CloudApi>) -> Response {
    let report = api.reconcile_now().await;
    if report.skipped {
        return (StatusCode::CONFLICT, Json(report)).into_response();
    }
    Json(report).into_response()
}
