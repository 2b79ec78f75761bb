//! The planner
//!
//! A periodic control loop that drives the observed cluster toward the
//! declared configuration. Each tick runs four phases in order: drop stuck
//! changes, drop dead hosts, plan new changes, then execute the fleet-level
//! changes against the provider. Planning is skipped entirely while any
//! change is still pending, so a pass always works from an authoritative
//! view of capacity.
//!
//! Hosts are considered in ascending host id order and applications in
//! ascending name order, so two planners given the same input queue the same
//! changes.

use crate::audit::{AuditLevel, AuditLog};
use crate::clock::{Clock, older_than};
use crate::config_store::ConfigStore;
use crate::defaults;
use crate::provider::{Provider, ProviderInstanceType};
use crate::state_store::StateStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use trainer_core::{ChangeKind, ChangeState, HostRecord, Resources, RunningApp, VersionConfig};

const SUBSYSTEM: &str = "planner";

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub tick_interval: Duration,
    pub change_default_timeout: Duration,
    pub change_spawn_timeout: Duration,
    pub dead_host_timeout: Duration,
    /// Spot culls within the failure window before spot use is suspended.
    pub spot_failure_threshold: u32,
    pub spot_failure_window: Duration,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            tick_interval: defaults::PLANNER_TICK_INTERVAL,
            change_default_timeout: defaults::CHANGE_DEFAULT_TIMEOUT,
            change_spawn_timeout: defaults::CHANGE_SPAWN_TIMEOUT,
            dead_host_timeout: defaults::DEAD_HOST_TIMEOUT,
            spot_failure_threshold: defaults::SPOT_FAILURE_THRESHOLD,
            spot_failure_window: defaults::SPOT_FAILURE_WINDOW,
        }
    }
}

pub struct Planner {
    config: Arc<ConfigStore>,
    state: Arc<StateStore>,
    provider: Arc<dyn Provider>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    settings: PlannerSettings,
}

impl Planner {
    pub fn new(
        config: Arc<ConfigStore>,
        state: Arc<StateStore>,
        provider: Arc<dyn Provider>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            config,
            state,
            provider,
            audit,
            clock,
            settings,
        }
    }

    /// Tick until told to stop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    tracing::info!("planner stopping");
                    return;
                }
            }
        }
    }

    /// One full pass: sweep stuck changes, sweep dead hosts, plan, then
    /// execute fleet changes.
    pub async fn tick(&self) {
        let now = self.clock.now();
        self.sweep_stuck_changes(now);
        self.sweep_dead_hosts(now);
        self.plan(now);
        self.execute_server_changes().await;
    }

    /// A wedged host or provider must not hold a change slot forever.
    fn sweep_stuck_changes(&self, now: DateTime<Utc>) {
        for change in self.state.pending_changes() {
            let timeout = match change.kind {
                ChangeKind::SpawnServer { .. } => self.settings.change_spawn_timeout,
                _ => self.settings.change_default_timeout,
            };
            if older_than(now, change.created, timeout) {
                self.state.complete_change(change.id, ChangeState::Fail);
                self.audit.insert(
                    SUBSYSTEM,
                    AuditLevel::Warn,
                    format!("change {} timed out and was dropped", change.id),
                    change.kind.application(),
                    change.kind.host(),
                );
            }
        }
    }

    /// Forget hosts that stopped checking in, counting spot culls.
    fn sweep_dead_hosts(&self, now: DateTime<Utc>) {
        for host in self.state.get_all_hosts() {
            if !older_than(now, host.last_seen, self.settings.dead_host_timeout) {
                continue;
            }

            self.state.remove_host(&host.host_id);
            if host.spot_instance {
                self.provider.record_spot_failure(&host.instance_type, now);
            }
            self.audit.insert(
                SUBSYSTEM,
                AuditLevel::Warn,
                format!(
                    "host {} has not checked in since {}; removed from the cluster",
                    host.host_id, host.last_seen
                ),
                None,
                Some(&host.host_id),
            );

            for change in self.state.pending_changes() {
                if change.kind.host() == Some(host.host_id.as_str()) {
                    self.state.complete_change(change.id, ChangeState::Fail);
                    self.audit.insert(
                        SUBSYSTEM,
                        AuditLevel::Warn,
                        format!("dropped change {} targeting dead host", change.id),
                        change.kind.application(),
                        Some(&host.host_id),
                    );
                }
            }
        }
    }

    /// Diff desired against current and queue the converging changes.
    fn plan(&self, now: DateTime<Utc>) {
        // Only plan once the previous batch has drained; otherwise the
        // capacity snapshot below would not be authoritative.
        if self.state.has_pending_changes() {
            return;
        }

        let apps = self.config.get_all();
        let mut hosts = self.state.get_all_hosts();
        for host in &mut hosts {
            host.available_resources.used = used_resources(host, &apps);
        }

        let mut missing = Resources::ZERO;
        let mut queued = 0usize;

        for (name, app) in &apps {
            let Some(latest) = app.latest_version() else {
                continue;
            };
            let Some(version_config) = app.latest_config().cloned() else {
                continue;
            };
            let needs = version_config.needs;

            let running: u32 = hosts
                .iter()
                .filter_map(|h| h.apps.get(name))
                .filter(|a| a.version == latest)
                .map(|a| a.count)
                .sum();

            // Place replicas up to the QoS floor, then on up to the
            // steady-state target.
            let mut placed = running;
            let mut out_of_room = false;
            while placed < app.min_deployment {
                if self.place_replica(&mut hosts, name, latest, &version_config, &needs) {
                    queued += 1;
                    placed += 1;
                } else {
                    missing = missing.saturating_add(needs);
                    out_of_room = true;
                    break;
                }
            }
            while !out_of_room && placed < app.desired_deployment {
                if self.place_replica(&mut hosts, name, latest, &version_config, &needs) {
                    queued += 1;
                    placed += 1;
                } else {
                    missing = missing.saturating_add(needs);
                    break;
                }
            }

            // Cull replicas still on an obsolete version.
            for host in &hosts {
                if let Some(running_app) = host.apps.get(name)
                    && running_app.version != latest
                {
                    let change = self.state.add_change(ChangeKind::RemoveApp {
                        host: host.host_id.clone(),
                        application: name.clone(),
                        app_version: running_app.version,
                    });
                    if change.is_some() {
                        queued += 1;
                        self.audit.insert(
                            SUBSYSTEM,
                            AuditLevel::Info,
                            format!(
                                "queued removal of {} v{} (latest is v{})",
                                name, running_app.version, latest
                            ),
                            Some(name),
                            Some(&host.host_id),
                        );
                    }
                }
            }

            // Cull replicas beyond the desired count. At most one removal
            // per host per pass; the host drops the app entirely and the
            // next pass re-places what is still wanted.
            let mut counted = 0u32;
            for host in &hosts {
                let Some(running_app) = host.apps.get(name) else {
                    continue;
                };
                if running_app.version != latest {
                    continue;
                }
                counted += running_app.count;
                if counted > app.desired_deployment {
                    let change = self.state.add_change(ChangeKind::RemoveApp {
                        host: host.host_id.clone(),
                        application: name.clone(),
                        app_version: latest,
                    });
                    if change.is_some() {
                        queued += 1;
                        self.audit.insert(
                            SUBSYSTEM,
                            AuditLevel::Info,
                            format!("queued removal of {name} v{latest}: above desired count"),
                            Some(name),
                            Some(&host.host_id),
                        );
                    }
                }
            }
        }

        // Grow the fleet when something could not be placed.
        if !missing.is_zero() {
            if let Some(choice) = self.choose_instance_type(&missing) {
                let spot = self.should_use_spot(&choice, now);
                let change = self.state.add_change(ChangeKind::SpawnServer {
                    instance_type: choice.instance_type.clone(),
                    spot_instance: spot,
                });
                if change.is_some() {
                    queued += 1;
                    self.audit.insert(
                        SUBSYSTEM,
                        AuditLevel::Info,
                        format!(
                            "queued spawn of {} (spot: {spot}) for unplaced needs {:?}",
                            choice.instance_type, missing
                        ),
                        None,
                        None,
                    );
                }
            } else {
                self.audit.insert(
                    SUBSYSTEM,
                    AuditLevel::Warn,
                    format!("no instance type available for unplaced needs {missing:?}"),
                    None,
                    None,
                );
            }
        }

        // Cost reclaim, only when the cluster is otherwise converged.
        if queued == 0 {
            for host in &hosts {
                if host.apps.is_empty()
                    && self
                        .state
                        .add_change(ChangeKind::TerminateServer {
                            host: host.host_id.clone(),
                        })
                        .is_some()
                {
                    self.audit.insert(
                        SUBSYSTEM,
                        AuditLevel::Info,
                        "queued termination of empty host".to_string(),
                        None,
                        Some(&host.host_id),
                    );
                }
            }
        }
    }

    /// Queue one install on the first host with room that does not already
    /// run the app, reserving its needs in the pass-local snapshot.
    fn place_replica(
        &self,
        hosts: &mut [HostRecord],
        name: &str,
        version: u64,
        version_config: &VersionConfig,
        needs: &Resources,
    ) -> bool {
        let Some(host) = hosts
            .iter_mut()
            .find(|h| h.has_resources_for(needs) && !h.has_app(name))
        else {
            return false;
        };

        let change = self.state.add_change(ChangeKind::AddApp {
            host: host.host_id.clone(),
            application: name.to_string(),
            app_version: version,
            app_config: Some(version_config.clone()),
        });
        if change.is_none() {
            return false;
        }

        host.available_resources.reserve(needs);
        host.apps.insert(
            name.to_string(),
            RunningApp {
                version,
                count: 1,
                last_stats: None,
            },
        );
        self.audit.insert(
            SUBSYSTEM,
            AuditLevel::Info,
            format!("queued install of {name} v{version}"),
            Some(name),
            Some(&host.host_id),
        );
        true
    }

    /// Cheapest instance type whose totals satisfy `needs`; ties broken by
    /// total capacity, then name. If nothing is big enough on its own, take
    /// the largest type so the fleet still grows and the next pass places
    /// what fits.
    fn choose_instance_type(&self, needs: &Resources) -> Option<ProviderInstanceType> {
        let catalog = self.provider.available_instance_types();
        let mut fitting: Vec<ProviderInstanceType> = catalog
            .iter()
            .filter(|t| needs.fits_within(&t.total_resources))
            .cloned()
            .collect();

        if fitting.is_empty() {
            return catalog.into_iter().max_by_key(|t| {
                (
                    total_capacity(t),
                    std::cmp::Reverse(t.instance_type.clone()),
                )
            });
        }

        fitting.sort_by(|a, b| {
            a.cost
                .partial_cmp(&b.cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| total_capacity(a).cmp(&total_capacity(b)))
                .then_with(|| a.instance_type.cmp(&b.instance_type))
        });
        fitting.into_iter().next()
    }

    /// Spot is used while the type supports it and recent culls stay under
    /// the threshold; once the failure window passes, spot use resumes.
    fn should_use_spot(&self, ty: &ProviderInstanceType, now: DateTime<Utc>) -> bool {
        if !ty.supports_spot {
            return false;
        }
        let recent_failures = match ty.last_spot_failure {
            Some(at) if !older_than(now, at, self.settings.spot_failure_window) => {
                ty.spot_termination_count
            }
            _ => 0,
        };
        recent_failures < self.settings.spot_failure_threshold
    }

    /// Carry out fleet-level changes, one provider call at a time.
    async fn execute_server_changes(&self) {
        for change in self.state.pending_changes() {
            match &change.kind {
                ChangeKind::SpawnServer {
                    instance_type,
                    spot_instance,
                } => match self.provider.spawn_instance(instance_type, *spot_instance).await {
                    Ok(host_id) => {
                        self.state.complete_change(change.id, ChangeState::Success);
                        self.audit.insert(
                            SUBSYSTEM,
                            AuditLevel::Info,
                            format!("spawned {host_id} ({instance_type}, spot: {spot_instance})"),
                            None,
                            Some(&host_id),
                        );
                    }
                    Err(e) => {
                        // Left in the queue; the timeout sweep reaps it if
                        // this keeps failing and a later pass re-plans.
                        self.audit.insert(
                            SUBSYSTEM,
                            AuditLevel::Error,
                            format!("spawn of {instance_type} failed: {e}"),
                            None,
                            None,
                        );
                    }
                },
                ChangeKind::TerminateServer { host } => {
                    if self.provider.terminate_instance(host).await {
                        self.state.complete_change(change.id, ChangeState::Success);
                        self.state.remove_host(host);
                        self.audit.insert(
                            SUBSYSTEM,
                            AuditLevel::Info,
                            "terminated empty host".to_string(),
                            None,
                            Some(host),
                        );
                    } else {
                        self.audit.insert(
                            SUBSYSTEM,
                            AuditLevel::Error,
                            "terminate call failed".to_string(),
                            None,
                            Some(host),
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

fn used_resources(
    host: &HostRecord,
    apps: &std::collections::BTreeMap<String, trainer_core::ApplicationConfiguration>,
) -> Resources {
    let mut used = Resources::ZERO;
    for (name, running) in &host.apps {
        if let Some(needs) = apps.get(name).and_then(|a| a.needs_for(running.version)) {
            used = used.saturating_add(needs.scale(running.count as u64));
        }
    }
    used
}

fn total_capacity(ty: &ProviderInstanceType) -> u64 {
    let r = ty.total_resources;
    r.cpu + r.memory + r.network
}
