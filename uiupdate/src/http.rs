//! HTTP surface
//!
//! ```text
//! GET    /api/v1/                   501, reserved
//! GET    /api/v1/version/           served UI as JSON
//! POST   /api/v1/update/:version/   update every master to :version
//! DELETE /api/v1/reset/             reset every master to the pre-bundled UI
//! ```

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;
use uiupdate_core::{ResetOutcome, UiService, UiUpdateError, UiVersion, UpdateOutcome};

/// Application state for the handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<UiService>,
}

pub fn create_router(service: Arc<UiService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/api/v1/", get(reserved))
        .route("/api/v1/version/", get(version))
        .route("/api/v1/version", get(version))
        .route("/api/v1/update/:version/", post(update))
        .route("/api/v1/update/:version", post(update))
        .route("/api/v1/reset/", delete(reset))
        .route("/api/v1/reset", delete(reset))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn reserved() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

async fn version(State(state): State<AppState>) -> Response {
    match state.service.version_info().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => internal_error("reading current version", e),
    }
}

async fn update(
    State(state): State<AppState>,
    Path(version): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let version = match UiVersion::parse(version) {
        Ok(version) => version,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match state.service.update(&version, authorization).await {
        Ok(UpdateOutcome::Finished(result)) if result.successful => {
            (StatusCode::OK, result.message).into_response()
        }
        Ok(UpdateOutcome::Finished(result)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, result.message).into_response()
        }
        Ok(UpdateOutcome::VersionNotFound) => (
            StatusCode::BAD_REQUEST,
            format!("Requested version {} not found", version.as_str()),
        )
            .into_response(),
        Ok(UpdateOutcome::AlreadyInProgress) => (
            StatusCode::ACCEPTED,
            format!("Update to {} already in progress", version.as_str()),
        )
            .into_response(),
        Ok(UpdateOutcome::Conflict) => (
            StatusCode::CONFLICT,
            "Another operation is in progress".to_string(),
        )
            .into_response(),
        Err(e) => internal_error("updating UI", e),
    }
}

async fn reset(State(state): State<AppState>) -> Response {
    match state.service.reset().await {
        Ok(ResetOutcome::Finished(result)) if result.successful => {
            (StatusCode::OK, result.message).into_response()
        }
        Ok(ResetOutcome::Finished(result)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, result.message).into_response()
        }
        Ok(ResetOutcome::Conflict) => (
            StatusCode::CONFLICT,
            "Another operation is in progress".to_string(),
        )
            .into_response(),
        Err(e) => internal_error("resetting UI", e),
    }
}

fn internal_error(action: &str, e: UiUpdateError) -> Response {
    error!(error = %e, "{} failed", action);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{} failed: {}", action, e),
    )
        .into_response()
}
