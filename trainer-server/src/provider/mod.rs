//! Cloud provider adapter
//!
//! The only polymorphic boundary in the trainer: spawn, terminate and
//! describe instances, keep the per-instance-type catalog with its
//! spot-failure counters, and attach or detach replicas from load balancers.

mod aws;

pub use aws::*;
pub use test::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use trainer_core::Resources;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("instance type '{0}' is not in the provider catalog")]
    UnknownInstanceType(String),

    /// The provider rejected the request; a later attempt may succeed.
    #[error("provider request failed: {0}")]
    Transient(String),

    /// The provider is unusable until an operator intervenes.
    #[error("provider is not usable: {0}")]
    Fatal(String),
}

/// One purchasable instance type with its spot-failure history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderInstanceType {
    pub instance_type: String,
    pub cost: f64,
    #[serde(default)]
    pub spot_cost: f64,
    #[serde(default)]
    pub supports_spot: bool,
    pub total_resources: Resources,
    #[serde(default)]
    pub spot_termination_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_spot_failure: Option<DateTime<Utc>>,
}

/// What the provider knows about a live instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance_type: String,
    pub spot_instance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancerEvent {
    Running,
    Dead,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Catalog snapshot, ascending by instance type name.
    fn available_instance_types(&self) -> Vec<ProviderInstanceType>;

    /// Catalog entry for one type, including current spot counters.
    fn get_available_instances(&self, instance_type: &str) -> Option<ProviderInstanceType>;

    /// Synchronously bring up one instance; resolves to its host id.
    async fn spawn_instance(
        &self,
        instance_type: &str,
        spot: bool,
    ) -> Result<String, ProviderError>;

    async fn terminate_instance(&self, host_id: &str) -> bool;

    /// Look up a live instance, e.g. when an unknown host checks in.
    async fn describe_instance(&self, host_id: &str) -> Option<InstanceDescription>;

    /// Note a spot cull for an instance type; gates future spot use.
    fn record_spot_failure(&self, instance_type: &str, at: DateTime<Utc>);

    /// Attach or detach one replica from its load balancer. Idempotent;
    /// a no-op for worker-typed apps (the caller filters).
    async fn update_load_balancers(
        &self,
        host_id: &str,
        app: &str,
        version: u64,
        event: LoadBalancerEvent,
    );
}

/// Shared catalog bookkeeping used by every provider implementation.
pub struct InstanceCatalog {
    entries: Mutex<BTreeMap<String, ProviderInstanceType>>,
}

impl InstanceCatalog {
    pub fn new(entries: Vec<ProviderInstanceType>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| (e.instance_type.clone(), e))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn all(&self) -> Vec<ProviderInstanceType> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn get(&self, instance_type: &str) -> Option<ProviderInstanceType> {
        self.entries.lock().get(instance_type).cloned()
    }

    pub fn contains(&self, instance_type: &str) -> bool {
        self.entries.lock().contains_key(instance_type)
    }

    pub fn record_spot_failure(&self, instance_type: &str, at: DateTime<Utc>) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(instance_type) {
            entry.spot_termination_count += 1;
            entry.last_spot_failure = Some(at);
            tracing::warn!(
                instance_type = %instance_type,
                terminations = entry.spot_termination_count,
                "recorded spot instance failure"
            );
        }
    }
}

/// Load an instance-type catalog from a JSON file.
pub fn load_catalog(path: &Path) -> Result<Vec<ProviderInstanceType>, ProviderError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ProviderError::Fatal(format!("cannot read catalog {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| ProviderError::Fatal(format!("cannot parse catalog {}: {e}", path.display())))
}

/// Built-in catalog used when no catalog file is configured.
pub fn default_catalog() -> Vec<ProviderInstanceType> {
    vec![
        ProviderInstanceType {
            instance_type: "i1".to_string(),
            cost: 0.10,
            spot_cost: 0.03,
            supports_spot: true,
            total_resources: Resources::new(100, 100, 100),
            spot_termination_count: 0,
            last_spot_failure: None,
        },
        ProviderInstanceType {
            instance_type: "i2".to_string(),
            cost: 0.40,
            spot_cost: 0.12,
            supports_spot: true,
            total_resources: Resources::new(400, 400, 400),
            spot_termination_count: 0,
            last_spot_failure: None,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderType {
    Aws,
    Test,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::Aws => write!(f, "aws"),
            ProviderType::Test => write!(f, "test"),
        }
    }
}

pub fn build_provider(
    kind: ProviderType,
    catalog: Vec<ProviderInstanceType>,
    aws: AwsSettings,
) -> Arc<dyn Provider> {
    tracing::info!(provider = ?kind, "initializing cloud provider");
    match kind {
        ProviderType::Aws => Arc::new(AwsProvider::new(aws, catalog)),
        ProviderType::Test => Arc::new(TestProvider::new(catalog)),
    }
}
