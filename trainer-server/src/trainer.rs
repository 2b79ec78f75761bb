//! The trainer aggregate
//!
//! One value owning the configuration store, state store, audit log, provider
//! and clock. Handlers and the planner all borrow from here; tests construct
//! their own instance instead of touching globals.

use crate::audit::{AuditLevel, AuditLog};
use crate::clock::Clock;
use crate::config_store::ConfigStore;
use crate::defaults;
use crate::planner::{Planner, PlannerSettings};
use crate::provider::{LoadBalancerEvent, Provider};
use crate::state_store::{StateError, StateStore};
use std::sync::Arc;
use trainer_core::{
    AppType, CheckinRequest, CheckinResponse, HostRecord, InstanceResources,
};

const SUBSYSTEM: &str = "api";

#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub planner: PlannerSettings,
    /// Instance type assumed for hosts the provider cannot describe.
    pub default_instance_type: String,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            planner: PlannerSettings::default(),
            default_instance_type: "i1".to_string(),
        }
    }
}

pub struct Trainer {
    pub config: Arc<ConfigStore>,
    pub state: Arc<StateStore>,
    pub audit: Arc<AuditLog>,
    pub provider: Arc<dyn Provider>,
    pub clock: Arc<dyn Clock>,
    pub settings: TrainerSettings,
}

impl Trainer {
    pub fn new(
        config: Arc<ConfigStore>,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        settings: TrainerSettings,
    ) -> Self {
        let state = Arc::new(StateStore::new(clock.clone()));
        let audit = Arc::new(AuditLog::new(defaults::AUDIT_CAPACITY, clock.clone()));
        Self {
            config,
            state,
            audit,
            provider,
            clock,
            settings,
        }
    }

    pub fn planner(self: &Arc<Self>) -> Planner {
        Planner::new(
            self.config.clone(),
            self.state.clone(),
            self.provider.clone(),
            self.audit.clone(),
            self.clock.clone(),
            self.settings.planner.clone(),
        )
    }

    /// Full check-in handling: admit unknown hosts, apply the report, notify
    /// load balancers, and pick the instruction to send back.
    pub async fn handle_checkin(
        &self,
        host_id: &str,
        report: &CheckinRequest,
    ) -> Result<CheckinResponse, StateError> {
        if self.state.get_host(host_id).is_none() {
            let record = self.admit_host(host_id, report).await;
            if self.state.register_host(record) {
                self.audit.insert(
                    SUBSYSTEM,
                    AuditLevel::Info,
                    "host joined the cluster".to_string(),
                    None,
                    Some(host_id),
                );
            }
        }

        let outcome = self.state.check_in(host_id, report)?;

        for change in &outcome.acked {
            self.audit.insert(
                SUBSYSTEM,
                AuditLevel::Info,
                format!("change {} acknowledged", change.id),
                change.kind.application(),
                Some(host_id),
            );
        }

        // Load-balancer attachment is idempotent and a no-op for workers.
        let apps = self.config.get_all();
        let is_http = |name: &str| {
            apps.get(name)
                .map(|a| a.app_type == AppType::Http && !a.load_balancer.is_empty())
                .unwrap_or(false)
        };
        for (name, version) in &outcome.running {
            if is_http(name) {
                self.provider
                    .update_load_balancers(host_id, name, *version, LoadBalancerEvent::Running)
                    .await;
            }
        }
        for (name, version) in &outcome.stopped {
            if is_http(name) {
                self.provider
                    .update_load_balancers(host_id, name, *version, LoadBalancerEvent::Dead)
                    .await;
            }
        }

        Ok(CheckinResponse {
            trainer_version: env!("CARGO_PKG_VERSION").to_string(),
            change: outcome.change,
        })
    }

    /// Build the record for a host seen for the first time. The provider
    /// knows spawned instances; anything else gets the configured default
    /// instance type.
    async fn admit_host(&self, host_id: &str, report: &CheckinRequest) -> HostRecord {
        let (instance_type, spot) = match self.provider.describe_instance(host_id).await {
            Some(desc) => (desc.instance_type, desc.spot_instance),
            None => (self.settings.default_instance_type.clone(), false),
        };
        let total = self
            .provider
            .get_available_instances(&instance_type)
            .map(|t| t.total_resources)
            .unwrap_or_default();

        let mut record = HostRecord::new(host_id, instance_type);
        record.ip_address = report.host_info.ip_addr.clone();
        record.spot_instance = spot;
        record.last_seen = self.clock.now();
        record.available_resources = InstanceResources::with_total(total);
        record
    }
}
