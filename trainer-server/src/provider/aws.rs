//! AWS provider adapter
//!
//! Carries the catalog and spot bookkeeping for an AWS fleet. The EC2 and
//! ELB calls themselves are not wired up in this build; every fleet call
//! reports a fatal provider error, which the planner tolerates by leaving
//! the change queued for the next sweep.

use super::{
    InstanceCatalog, InstanceDescription, LoadBalancerEvent, Provider, ProviderError,
    ProviderInstanceType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct AwsSettings {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub ami: String,
    pub security_group: String,
}

impl AwsSettings {
    pub fn has_credentials(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }
}

pub struct AwsProvider {
    settings: AwsSettings,
    catalog: InstanceCatalog,
}

impl AwsProvider {
    pub fn new(settings: AwsSettings, catalog: Vec<ProviderInstanceType>) -> Self {
        if !settings.has_credentials() {
            tracing::error!(
                region = %settings.region,
                "AWS credentials are not configured; fleet changes will fail until they are"
            );
        }
        Self {
            settings,
            catalog: InstanceCatalog::new(catalog),
        }
    }

    fn fatal(&self, call: &str) -> ProviderError {
        if !self.settings.has_credentials() {
            tracing::error!(call, "AWS call refused: credentials are not configured");
            ProviderError::Fatal("AWS credentials are not configured".to_string())
        } else {
            tracing::error!(call, "AWS call refused: EC2 integration is not enabled in this build");
            ProviderError::Fatal("AWS EC2 integration is not enabled in this build".to_string())
        }
    }
}

#[async_trait]
impl Provider for AwsProvider {
    fn available_instance_types(&self) -> Vec<ProviderInstanceType> {
        self.catalog.all()
    }

    fn get_available_instances(&self, instance_type: &str) -> Option<ProviderInstanceType> {
        self.catalog.get(instance_type)
    }

    async fn spawn_instance(
        &self,
        instance_type: &str,
        _spot: bool,
    ) -> Result<String, ProviderError> {
        if !self.catalog.contains(instance_type) {
            return Err(ProviderError::UnknownInstanceType(instance_type.to_string()));
        }
        Err(self.fatal("spawn_instance"))
    }

    async fn terminate_instance(&self, host_id: &str) -> bool {
        tracing::error!(host = %host_id, "AWS terminate refused: EC2 integration is not enabled");
        false
    }

    async fn describe_instance(&self, _host_id: &str) -> Option<InstanceDescription> {
        None
    }

    fn record_spot_failure(&self, instance_type: &str, at: DateTime<Utc>) {
        self.catalog.record_spot_failure(instance_type, at);
    }

    async fn update_load_balancers(
        &self,
        host_id: &str,
        app: &str,
        version: u64,
        _event: LoadBalancerEvent,
    ) {
        tracing::error!(
            host = %host_id,
            app = %app,
            version,
            "AWS load balancer update refused: ELB integration is not enabled"
        );
    }
}
