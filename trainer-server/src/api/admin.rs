//! Admin endpoints
//!
//! Snapshot reads of configuration, cluster state and the audit log, plus
//! the two write paths: upserting an application's deployment counts and
//! publishing a new version configuration.

use super::ApiError;
use crate::audit::{AuditEvent, AuditLevel};
use crate::config_store::ConfigError;
use crate::trainer::Trainer;
use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use trainer_core::{AppType, ApplicationConfiguration, VersionConfig};

const SUBSYSTEM: &str = "api";

#[derive(Debug, Deserialize)]
pub struct ApplicationQuery {
    pub application: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub application: Option<String>,
}

/// Body of `POST /config/applications?application=<name>`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentSpec {
    #[serde(rename = "Type", default = "default_app_type")]
    pub app_type: AppType,
    pub min_deployment: u32,
    pub desired_deployment: u32,
    #[serde(default)]
    pub load_balancer: String,
    #[serde(default)]
    pub network: String,
}

fn default_app_type() -> AppType {
    AppType::Http
}

pub async fn get_config(
    State(trainer): State<Arc<Trainer>>,
) -> Json<BTreeMap<String, ApplicationConfiguration>> {
    Json(trainer.config.get_all())
}

pub async fn list_applications(
    State(trainer): State<Arc<Trainer>>,
) -> Json<Vec<ApplicationConfiguration>> {
    Json(trainer.config.get_all().into_values().collect())
}

/// Create the application if it is new, then set its deployment counts.
pub async fn upsert_application(
    State(trainer): State<Arc<Trainer>>,
    Query(query): Query<ApplicationQuery>,
    Json(spec): Json<DeploymentSpec>,
) -> Result<Json<ApplicationConfiguration>, ApiError> {
    let name = query.application;
    if name.is_empty() {
        return Err(ApiError::bad_request("application query parameter is required"));
    }

    if let Err(ConfigError::NotFound(_)) = trainer.config.get(&name) {
        trainer.config.add(
            &name,
            ApplicationConfiguration {
                name: name.clone(),
                app_type: spec.app_type,
                min_deployment: spec.min_deployment,
                desired_deployment: spec.desired_deployment,
                load_balancer: spec.load_balancer.clone(),
                network: spec.network.clone(),
                config: BTreeMap::new(),
            },
        )?;
    }

    let updated =
        trainer
            .config
            .update_deployment_counts(&name, spec.min_deployment, spec.desired_deployment)?;

    trainer.audit.insert(
        SUBSYSTEM,
        AuditLevel::Info,
        format!(
            "application declared with min {} / desired {}",
            spec.min_deployment, spec.desired_deployment
        ),
        Some(&name),
        None,
    );
    Ok(Json(updated))
}

pub async fn get_latest_version(
    State(trainer): State<Arc<Trainer>>,
    Query(query): Query<ApplicationQuery>,
) -> Result<Json<VersionConfig>, ApiError> {
    let app = trainer.config.get(&query.application)?;
    let latest = app
        .latest_config()
        .cloned()
        .ok_or_else(|| ConfigError::NotFound(format!("{}: no versions", query.application)))?;
    Ok(Json(latest))
}

/// Publish a new version; the server assigns the next integer version.
pub async fn append_version(
    State(trainer): State<Arc<Trainer>>,
    Query(query): Query<ApplicationQuery>,
    Json(version_config): Json<VersionConfig>,
) -> Result<Json<VersionConfig>, ApiError> {
    let stored = trainer
        .config
        .append_version(&query.application, version_config)?;

    trainer.audit.insert(
        SUBSYSTEM,
        AuditLevel::Info,
        format!("published version {} ({})", stored.version, stored.image),
        Some(&query.application),
        None,
    );
    Ok(Json(stored))
}

pub async fn get_state(State(trainer): State<Arc<Trainer>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "Hosts": trainer.state.get_all_hosts(),
        "Changes": trainer.state.pending_changes(),
    }))
}

pub async fn get_audit(
    State(trainer): State<Arc<Trainer>>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditEvent>> {
    Json(trainer.audit.query(query.application.as_deref()))
}
