//! Host check-in endpoint
//!
//! `POST /checkin?host=<HostId>`: apply the host's report and hand back at
//! most one pending change. The handler never creates changes; it only
//! acknowledges and serves them.

use super::ApiError;
use crate::trainer::Trainer;
use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use std::sync::Arc;
use trainer_core::{CheckinRequest, CheckinResponse};

#[derive(Debug, Deserialize)]
pub struct CheckinQuery {
    pub host: String,
}

pub async fn host_checkin(
    State(trainer): State<Arc<Trainer>>,
    Query(query): Query<CheckinQuery>,
    Json(report): Json<CheckinRequest>,
) -> Result<Json<CheckinResponse>, ApiError> {
    if query.host.is_empty() {
        return Err(ApiError::bad_request("host query parameter is required"));
    }

    tracing::debug!(host = %query.host, apps = report.host_info.apps.len(), "host check-in");
    let response = trainer.handle_checkin(&query.host, &report).await?;
    Ok(Json(response))
}
