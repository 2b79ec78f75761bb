//! HTTP API
//!
//! One router serving both surfaces: the host agent check-in endpoint and
//! the admin read/write endpoints. Requests carry a hard server-side
//! deadline; malformed bodies are rejected before any state mutation.

mod admin;
mod checkin;

use crate::config_store::ConfigError;
use crate::defaults;
use crate::state_store::StateError;
use crate::trainer::Trainer;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub fn router(trainer: Arc<Trainer>) -> Router {
    Router::new()
        .route("/checkin", post(checkin::host_checkin))
        .route("/config", get(admin::get_config))
        .route(
            "/config/applications",
            get(admin::list_applications).post(admin::upsert_application),
        )
        .route(
            "/config/applications/configuration/latest",
            get(admin::get_latest_version).post(admin::append_version),
        )
        .route("/state", get(admin::get_state))
        .route("/audit", get(admin::get_audit))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(defaults::REQUEST_DEADLINE))
        .with_state(trainer)
}

/// Error envelope returned by every endpoint.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        let status = match err {
            ConfigError::NotFound(_) => StatusCode::NOT_FOUND,
            ConfigError::AlreadyExists(_) => StatusCode::CONFLICT,
            ConfigError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ConfigError::Io(_) | ConfigError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = axum::Json(serde_json::json!({ "Error": self.message }));
        (self.status, body).into_response()
    }
}
