use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use trainer_core::{
    AppObservation, AppStatus, AppType, ApplicationConfiguration, ChangeKind, CheckinRequest,
    HostInfo, Resources, VersionConfig,
};
use trainer_server::clock::ManualClock;
use trainer_server::config_store::ConfigStore;
use trainer_server::planner::Planner;
use trainer_server::provider::{ProviderInstanceType, TestProvider};
use trainer_server::trainer::{Trainer, TrainerSettings};

pub struct Cluster {
    pub clock: Arc<ManualClock>,
    pub provider: Arc<TestProvider>,
    pub trainer: Arc<Trainer>,
    pub planner: Planner,
    _temp: TempDir,
}

pub fn catalog_i1() -> Vec<ProviderInstanceType> {
    vec![ProviderInstanceType {
        instance_type: "i1".to_string(),
        cost: 0.10,
        spot_cost: 0.03,
        supports_spot: true,
        total_resources: Resources::new(100, 100, 100),
        spot_termination_count: 0,
        last_spot_failure: None,
    }]
}

pub fn cluster() -> Cluster {
    cluster_with_settings(TrainerSettings::default(), catalog_i1())
}

#[allow(dead_code)]
pub fn cluster_with_settings(
    settings: TrainerSettings,
    catalog: Vec<ProviderInstanceType>,
) -> Cluster {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new("2016-11-01T10:00:00Z".parse().unwrap()));
    let config = Arc::new(ConfigStore::open(temp.path().join("apps.json")).unwrap());
    let provider = Arc::new(TestProvider::new(catalog));
    let trainer = Arc::new(Trainer::new(
        config,
        provider.clone(),
        clock.clone(),
        settings,
    ));
    let planner = trainer.planner();
    Cluster {
        clock,
        provider,
        trainer,
        planner,
        _temp: temp,
    }
}

pub fn declare_app(
    cluster: &Cluster,
    name: &str,
    app_type: AppType,
    min: u32,
    desired: u32,
    needs: Resources,
) {
    let load_balancer = match app_type {
        AppType::Http => format!("lb-{name}"),
        AppType::Worker => String::new(),
    };
    cluster
        .trainer
        .config
        .add(
            name,
            ApplicationConfiguration {
                name: name.to_string(),
                app_type,
                min_deployment: min,
                desired_deployment: desired,
                load_balancer,
                network: "net1".to_string(),
                config: BTreeMap::new(),
            },
        )
        .unwrap();
    publish_version(cluster, name, needs);
}

#[allow(dead_code)]
pub fn publish_version(cluster: &Cluster, name: &str, needs: Resources) {
    cluster
        .trainer
        .config
        .append_version(
            name,
            VersionConfig {
                image: format!("registry/{name}"),
                run_command: "docker run".to_string(),
                stop_command: "docker stop".to_string(),
                needs,
                ..Default::default()
            },
        )
        .unwrap();
}

pub fn report(apps: &[(&str, u64, AppStatus)]) -> CheckinRequest {
    CheckinRequest {
        host_info: HostInfo {
            ip_addr: "10.0.0.1".to_string(),
            os_info: Default::default(),
            apps: apps
                .iter()
                .enumerate()
                .map(|(i, (name, version, status))| AppObservation {
                    name: name.to_string(),
                    version: *version,
                    status: *status,
                    id: format!("{name}_{i}"),
                })
                .collect(),
        },
        stats: Default::default(),
    }
}

/// One check-in for `host`, reporting everything in `apps` as running.
pub async fn checkin(
    cluster: &Cluster,
    host: &str,
    apps: &[(&str, u64, AppStatus)],
) -> Option<trainer_core::ChangeRequest> {
    cluster
        .trainer
        .handle_checkin(host, &report(apps))
        .await
        .unwrap()
        .change
}

/// A minimal agent fleet: every host reports its installed apps as running
/// and applies whatever change the trainer hands back.
#[allow(dead_code)]
pub async fn agent_round(cluster: &Cluster, fleet: &mut BTreeMap<String, BTreeMap<String, u64>>) {
    for spawned in cluster.provider.spawn_log() {
        fleet.entry(spawned.host_id).or_default();
    }
    for terminated in cluster.provider.terminate_log() {
        fleet.remove(&terminated);
    }

    let hosts: Vec<String> = fleet.keys().cloned().collect();
    for host in hosts {
        let apps: Vec<(String, u64)> = fleet[&host]
            .iter()
            .map(|(name, version)| (name.clone(), *version))
            .collect();
        let observed: Vec<(&str, u64, AppStatus)> = apps
            .iter()
            .map(|(name, version)| (name.as_str(), *version, AppStatus::Running))
            .collect();

        if let Some(change) = checkin(cluster, &host, &observed).await {
            let installed = fleet.get_mut(&host).unwrap();
            match change.kind {
                ChangeKind::AddApp {
                    application,
                    app_version,
                    ..
                } => {
                    installed.insert(application, app_version);
                }
                ChangeKind::RemoveApp { application, .. } => {
                    installed.remove(&application);
                }
                _ => {}
            }
        }
    }
}

/// The universal invariants that must hold in every reachable state.
#[allow(dead_code)]
pub fn assert_invariants(cluster: &Cluster) {
    let apps = cluster.trainer.config.get_all();

    // I1: per host, declared needs of everything running fit the totals.
    for host in cluster.trainer.state.get_all_hosts() {
        let mut used = Resources::ZERO;
        for (name, running) in &host.apps {
            if let Some(needs) = apps.get(name).and_then(|a| a.needs_for(running.version)) {
                used = used.saturating_add(needs.scale(running.count as u64));
            }
        }
        assert!(
            used.fits_within(&host.available_resources.total),
            "host {} over capacity: {used:?} > {:?}",
            host.host_id,
            host.available_resources.total
        );
    }

    let changes = cluster.trainer.state.pending_changes();

    // I2: at most one app change per (host, application).
    let mut seen = std::collections::BTreeSet::new();
    for change in &changes {
        if change.kind.is_app_change() {
            let key = (
                change.kind.host().unwrap().to_string(),
                change.kind.application().unwrap().to_string(),
            );
            assert!(seen.insert(key.clone()), "duplicate app change for {key:?}");
        }
    }

    // I3: every ADD_APP references a configured version.
    for change in &changes {
        if let ChangeKind::AddApp {
            application,
            app_version,
            ..
        } = &change.kind
        {
            let known = apps
                .get(application)
                .is_some_and(|a| a.config.contains_key(app_version));
            assert!(known, "ADD_APP references unknown {application} v{app_version}");
        }
    }

    // I5: at most one spawn in flight.
    let spawns = changes
        .iter()
        .filter(|c| matches!(c.kind, ChangeKind::SpawnServer { .. }))
        .count();
    assert!(spawns <= 1, "{spawns} spawns pending at once");
}
