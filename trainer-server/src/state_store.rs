//! Observed cluster state
//!
//! Hosts, what they run, and the queue of pending changes. Everything here
//! is reconstructed from check-ins; nothing is persisted. This is the only
//! place that mutates `HostRecord::last_seen` and `HostRecord::apps`, and
//! the check-in mutation happens under one write lock so planner reads never
//! observe a half-applied report.

use crate::clock::Clock;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use trainer_core::{
    AppStatus, ChangeKind, ChangeRequest, ChangeState, CheckinRequest, HostRecord, RunningApp,
};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("unknown host '{0}'")]
    UnknownHost(String),
}

/// What one check-in did to the store, for the caller to audit and to turn
/// into load-balancer updates.
#[derive(Debug, Default)]
pub struct CheckinOutcome {
    /// The change to hand back to the host, if any.
    pub change: Option<ChangeRequest>,
    /// Changes the report acknowledged; removed from the queue.
    pub acked: Vec<ChangeRequest>,
    /// Apps currently running on this host, `(name, version)`. Load-balancer
    /// attachment is idempotent, so these are reported on every check-in.
    pub running: Vec<(String, u64)>,
    /// Apps reported dead or no longer reported at all, `(name, version)`.
    pub stopped: Vec<(String, u64)>,
}

struct Inner {
    hosts: BTreeMap<String, HostRecord>,
    changes: Vec<ChangeRequest>,
}

pub struct StateStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                hosts: BTreeMap::new(),
                changes: Vec::new(),
            }),
            clock,
        }
    }

    /// Snapshot of all hosts in ascending `host_id` order.
    pub fn get_all_hosts(&self) -> Vec<HostRecord> {
        self.inner.read().hosts.values().cloned().collect()
    }

    pub fn get_host(&self, host_id: &str) -> Option<HostRecord> {
        self.inner.read().hosts.get(host_id).cloned()
    }

    /// Insert a host record unless one already exists. Returns whether the
    /// record was inserted.
    pub fn register_host(&self, record: HostRecord) -> bool {
        let mut inner = self.inner.write();
        match inner.hosts.entry(record.host_id.clone()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(record);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn remove_host(&self, host_id: &str) -> Option<HostRecord> {
        self.inner.write().hosts.remove(host_id)
    }

    /// Record `count` replicas of an app on a known host.
    pub fn add_app(
        &self,
        host_id: &str,
        name: &str,
        version: u64,
        count: u32,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.write();
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StateError::UnknownHost(host_id.to_string()))?;
        host.apps.insert(
            name.to_string(),
            RunningApp {
                version,
                count,
                last_stats: None,
            },
        );
        Ok(())
    }

    /// Total replica count of `name` at `version` across the fleet.
    pub fn deployment_count(&self, name: &str, version: u64) -> u32 {
        self.inner
            .read()
            .hosts
            .values()
            .filter_map(|h| h.apps.get(name))
            .filter(|a| a.version == version)
            .map(|a| a.count)
            .sum()
    }

    /// Queue a change. Assigns a fresh id and creation time.
    ///
    /// Returns `None` instead of queueing when doing so would put two app
    /// changes on the same `(host, application)` in flight at once, or a
    /// second spawn next to a pending one.
    pub fn add_change(&self, kind: ChangeKind) -> Option<ChangeRequest> {
        let now = self.clock.now();
        let mut inner = self.inner.write();

        if kind.is_app_change() {
            let conflict = inner.changes.iter().any(|c| {
                c.kind.is_app_change()
                    && c.kind.host() == kind.host()
                    && c.kind.application() == kind.application()
            });
            if conflict {
                tracing::warn!(
                    host = kind.host().unwrap_or(""),
                    application = kind.application().unwrap_or(""),
                    "dropping change: another app change for this host is already in flight"
                );
                return None;
            }
        } else if matches!(kind, ChangeKind::SpawnServer { .. }) {
            let spawn_pending = inner
                .changes
                .iter()
                .any(|c| matches!(c.kind, ChangeKind::SpawnServer { .. }));
            if spawn_pending {
                tracing::warn!("dropping spawn: another spawn is already in flight");
                return None;
            }
        }

        let change = ChangeRequest {
            id: Uuid::new_v4(),
            created: now,
            state: ChangeState::Queued,
            kind,
        };
        inner.changes.push(change.clone());
        Some(change)
    }

    pub fn delete_change(&self, id: Uuid) -> Option<ChangeRequest> {
        let mut inner = self.inner.write();
        let index = inner.changes.iter().position(|c| c.id == id)?;
        Some(inner.changes.remove(index))
    }

    /// Remove a change, stamping it with its terminal state for reporting.
    pub fn complete_change(&self, id: Uuid, state: ChangeState) -> Option<ChangeRequest> {
        let mut change = self.delete_change(id)?;
        change.state = state;
        Some(change)
    }

    /// Pending changes targeting `host_id`, oldest first.
    pub fn changes_for_host(&self, host_id: &str) -> Vec<ChangeRequest> {
        let mut changes: Vec<ChangeRequest> = self
            .inner
            .read()
            .changes
            .iter()
            .filter(|c| c.kind.host() == Some(host_id))
            .cloned()
            .collect();
        changes.sort_by(|a, b| a.created.cmp(&b.created));
        changes
    }

    /// All pending changes, oldest first.
    pub fn pending_changes(&self) -> Vec<ChangeRequest> {
        let mut changes = self.inner.read().changes.clone();
        changes.sort_by(|a, b| a.created.cmp(&b.created));
        changes
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.inner.read().changes.is_empty()
    }

    /// Apply one host report: refresh the record, acknowledge changes the
    /// report completes, and pick the oldest remaining app change for the
    /// host to carry out next.
    pub fn check_in(
        &self,
        host_id: &str,
        report: &CheckinRequest,
    ) -> Result<CheckinOutcome, StateError> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let Inner { hosts, changes } = &mut *inner;
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| StateError::UnknownHost(host_id.to_string()))?;

        // last_seen is monotonic; a replayed report cannot move it back.
        if now > host.last_seen {
            host.last_seen = now;
        }
        host.ip_address = report.host_info.ip_addr.clone();

        // Replace the apps map with the reported view. Replicas still
        // starting up occupy capacity, so DEPLOYING counts; DEAD does not.
        let mut apps: BTreeMap<String, RunningApp> = BTreeMap::new();
        for obs in &report.host_info.apps {
            if !matches!(obs.status, AppStatus::Running | AppStatus::Deploying) {
                continue;
            }
            let entry = apps.entry(obs.name.clone()).or_insert(RunningApp {
                version: obs.version,
                count: 0,
                last_stats: None,
            });
            if entry.version == obs.version {
                entry.count += 1;
            }
        }
        for (name, app) in apps.iter_mut() {
            app.last_stats = latest_app_sample(report, name, app.version);
        }

        let previous = std::mem::replace(&mut host.apps, apps);
        host.metrics = report.stats.host_metrics.clone();

        let mut outcome = CheckinOutcome::default();
        for (name, app) in &host.apps {
            let is_running = report.host_info.apps.iter().any(|o| {
                o.name == *name && o.version == app.version && o.status == AppStatus::Running
            });
            if is_running {
                outcome.running.push((name.clone(), app.version));
            }
        }
        for obs in &report.host_info.apps {
            if obs.status == AppStatus::Dead {
                outcome.stopped.push((obs.name.clone(), obs.version));
            }
        }
        for (name, app) in &previous {
            if !host.apps.contains_key(name) {
                outcome.stopped.push((name.clone(), app.version));
            }
        }
        outcome.stopped.sort();
        outcome.stopped.dedup();

        // Acknowledge changes the report completes: an ADD_APP once its app
        // runs at the requested version, a REMOVE_APP once the app is gone.
        let mut remaining = Vec::with_capacity(changes.len());
        for change in changes.drain(..) {
            let completed = match &change.kind {
                ChangeKind::AddApp {
                    host: h,
                    application,
                    app_version,
                    ..
                } if h == host_id => report.host_info.apps.iter().any(|o| {
                    o.name == *application
                        && o.version == *app_version
                        && o.status == AppStatus::Running
                }),
                ChangeKind::RemoveApp {
                    host: h,
                    application,
                    ..
                } if h == host_id => !report
                    .host_info
                    .apps
                    .iter()
                    .any(|o| o.name == *application),
                _ => false,
            };

            if completed {
                let mut done = change;
                done.state = ChangeState::Success;
                outcome.acked.push(done);
            } else {
                remaining.push(change);
            }
        }
        *changes = remaining;

        // Serve the oldest pending app change for this host, if any.
        let next = changes
            .iter_mut()
            .filter(|c| c.kind.is_app_change() && c.kind.host() == Some(host_id))
            .min_by_key(|c| c.created);
        if let Some(change) = next {
            change.state = ChangeState::Applying;
            outcome.change = Some(change.clone());
        }

        Ok(outcome)
    }
}

fn latest_app_sample(
    report: &CheckinRequest,
    name: &str,
    version: u64,
) -> Option<trainer_core::AppSample> {
    report
        .stats
        .app_metrics
        .get(name)
        .and_then(|versions| versions.get(&version.to_string()))
        .and_then(|samples| samples.values().next_back())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use trainer_core::{AppObservation, HostInfo, InstanceResources, MetricsBundle, Resources};

    fn store_with_clock() -> (Arc<ManualClock>, StateStore) {
        let clock = Arc::new(ManualClock::new("2016-11-01T10:00:00Z".parse().unwrap()));
        let store = StateStore::new(clock.clone());
        (clock, store)
    }

    fn host(id: &str) -> HostRecord {
        let mut record = HostRecord::new(id, "i1");
        record.available_resources = InstanceResources::with_total(Resources::new(100, 100, 100));
        record
    }

    fn report(apps: &[(&str, u64, AppStatus)]) -> CheckinRequest {
        CheckinRequest {
            host_info: HostInfo {
                ip_addr: "10.0.0.7".to_string(),
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
            stats: MetricsBundle::default(),
        }
    }

    fn add_app_change(store: &StateStore, host: &str, app: &str, version: u64) -> ChangeRequest {
        store
            .add_change(ChangeKind::AddApp {
                host: host.to_string(),
                application: app.to_string(),
                app_version: version,
                app_config: None,
            })
            .unwrap()
    }

    #[test]
    fn deployment_count_sums_matching_versions() {
        let (_clock, store) = store_with_clock();
        store.register_host(host("host1"));
        store.register_host(host("host2"));
        store.add_app("host1", "worker", 1, 2).unwrap();
        store.add_app("host2", "worker", 1, 3).unwrap();
        store.add_app("host2", "web", 1, 1).unwrap();

        assert_eq!(store.deployment_count("worker", 1), 5);
        assert_eq!(store.deployment_count("worker", 2), 0);
        assert_eq!(store.deployment_count("web", 1), 1);
    }

    #[test]
    fn add_app_rejects_unknown_host() {
        let (_clock, store) = store_with_clock();
        assert!(matches!(
            store.add_app("ghost", "web", 1, 1),
            Err(StateError::UnknownHost(_))
        ));
    }

    #[test]
    fn changes_for_host_are_ordered_by_creation() {
        let (clock, store) = store_with_clock();
        let first = add_app_change(&store, "host1", "web", 1);
        clock.advance(Duration::from_secs(1));
        let second = add_app_change(&store, "host1", "worker", 1);
        clock.advance(Duration::from_secs(1));
        add_app_change(&store, "host2", "web", 1);

        let changes = store.changes_for_host("host1");
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].id, first.id);
        assert_eq!(changes[1].id, second.id);
    }

    #[test]
    fn duplicate_app_change_is_suppressed() {
        let (_clock, store) = store_with_clock();
        add_app_change(&store, "host1", "web", 1);

        let duplicate = store.add_change(ChangeKind::RemoveApp {
            host: "host1".to_string(),
            application: "web".to_string(),
            app_version: 1,
        });
        assert!(duplicate.is_none());
        assert_eq!(store.pending_changes().len(), 1);
    }

    #[test]
    fn second_spawn_is_suppressed() {
        let (_clock, store) = store_with_clock();
        let spawn = ChangeKind::SpawnServer {
            instance_type: "i1".to_string(),
            spot_instance: true,
        };
        assert!(store.add_change(spawn.clone()).is_some());
        assert!(store.add_change(spawn).is_none());
    }

    #[test]
    fn check_in_updates_record_and_serves_oldest_change() {
        let (clock, store) = store_with_clock();
        store.register_host(host("host1"));
        let change = add_app_change(&store, "host1", "web", 1);

        clock.advance(Duration::from_secs(5));
        let outcome = store.check_in("host1", &report(&[])).unwrap();

        let served = outcome.change.unwrap();
        assert_eq!(served.id, change.id);
        assert_eq!(served.state, ChangeState::Applying);

        let record = store.get_host("host1").unwrap();
        assert_eq!(record.ip_address, "10.0.0.7");
        assert_eq!(record.last_seen, clock.now());
    }

    #[test]
    fn check_in_acks_completed_add() {
        let (_clock, store) = store_with_clock();
        store.register_host(host("host1"));
        add_app_change(&store, "host1", "web", 1);

        let outcome = store
            .check_in("host1", &report(&[("web", 1, AppStatus::Running)]))
            .unwrap();

        assert_eq!(outcome.acked.len(), 1);
        assert_eq!(outcome.acked[0].state, ChangeState::Success);
        assert!(outcome.change.is_none());
        assert!(!store.has_pending_changes());
    }

    #[test]
    fn deploying_report_keeps_change_and_reserves_capacity() {
        let (_clock, store) = store_with_clock();
        store.register_host(host("host1"));
        let change = add_app_change(&store, "host1", "web", 1);

        let outcome = store
            .check_in("host1", &report(&[("web", 1, AppStatus::Deploying)]))
            .unwrap();

        // Not acknowledged yet; the same change is served again.
        assert!(outcome.acked.is_empty());
        assert_eq!(outcome.change.unwrap().id, change.id);

        // But the replica occupies the apps map already.
        let record = store.get_host("host1").unwrap();
        assert!(record.has_app("web"));
    }

    #[test]
    fn check_in_acks_completed_remove() {
        let (_clock, store) = store_with_clock();
        store.register_host(host("host1"));
        store.add_app("host1", "web", 1, 1).unwrap();
        store
            .add_change(ChangeKind::RemoveApp {
                host: "host1".to_string(),
                application: "web".to_string(),
                app_version: 1,
            })
            .unwrap();

        let outcome = store.check_in("host1", &report(&[])).unwrap();
        assert_eq!(outcome.acked.len(), 1);
        assert!(!store.get_host("host1").unwrap().has_app("web"));
        assert_eq!(outcome.stopped, vec![("web".to_string(), 1)]);
    }

    #[test]
    fn dead_replicas_do_not_occupy_the_apps_map() {
        let (_clock, store) = store_with_clock();
        store.register_host(host("host1"));

        store
            .check_in("host1", &report(&[("web", 1, AppStatus::Dead)]))
            .unwrap();

        assert!(!store.get_host("host1").unwrap().has_app("web"));
    }

    #[test]
    fn replica_counts_aggregate_identical_versions() {
        let (_clock, store) = store_with_clock();
        store.register_host(host("host1"));

        store
            .check_in(
                "host1",
                &report(&[
                    ("worker", 1, AppStatus::Running),
                    ("worker", 1, AppStatus::Running),
                    ("worker", 1, AppStatus::Running),
                ]),
            )
            .unwrap();

        let record = store.get_host("host1").unwrap();
        assert_eq!(record.apps["worker"].count, 3);
        assert_eq!(store.deployment_count("worker", 1), 3);
    }

    #[test]
    fn check_in_is_idempotent() {
        let (_clock, store) = store_with_clock();
        store.register_host(host("host1"));
        add_app_change(&store, "host1", "web", 1);

        let body = report(&[("worker", 1, AppStatus::Running)]);
        let first = store.check_in("host1", &body).unwrap();
        let first_host = store.get_host("host1").unwrap();
        let second = store.check_in("host1", &body).unwrap();
        let second_host = store.get_host("host1").unwrap();

        assert_eq!(first.change, second.change);
        assert_eq!(first_host.apps, second_host.apps);
        assert_eq!(first.running, second.running);
        assert!(second.stopped.is_empty());
    }

    #[test]
    fn last_seen_never_decreases() {
        let (clock, store) = store_with_clock();
        store.register_host(host("host1"));

        clock.advance(Duration::from_secs(60));
        store.check_in("host1", &report(&[])).unwrap();
        let seen = store.get_host("host1").unwrap().last_seen;

        clock.set("2016-11-01T09:00:00Z".parse().unwrap());
        store.check_in("host1", &report(&[])).unwrap();
        assert_eq!(store.get_host("host1").unwrap().last_seen, seen);
    }

    #[test]
    fn running_and_dead_replicas_surface_for_load_balancing() {
        let (_clock, store) = store_with_clock();
        store.register_host(host("host1"));

        let outcome = store
            .check_in(
                "host1",
                &report(&[("web", 1, AppStatus::Running), ("old", 1, AppStatus::Dead)]),
            )
            .unwrap();
        assert_eq!(outcome.running, vec![("web".to_string(), 1)]);
        assert_eq!(outcome.stopped, vec![("old".to_string(), 1)]);
    }
}
