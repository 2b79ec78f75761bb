//! Cluster domain records
//!
//! Identifiers are opaque strings. Application versions are plain integers
//! that count up from 1 and never reuse a slot. All records serialize with
//! PascalCase keys to stay compatible with the host agent wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Whether an application fronts HTTP traffic (and participates in load
/// balancing) or runs background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Http,
    Worker,
}

/// Abstract resource amounts on the cpu/memory/network axes.
///
/// The same shape is used for host totals, host usage and per-version
/// application needs; the planner only ever compares them componentwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resources {
    pub cpu: u64,
    pub memory: u64,
    pub network: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu: 0,
        memory: 0,
        network: 0,
    };

    pub fn new(cpu: u64, memory: u64, network: u64) -> Self {
        Self {
            cpu,
            memory,
            network,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0 && self.network == 0
    }

    pub fn saturating_add(self, other: Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            network: self.network.saturating_add(other.network),
        }
    }

    pub fn scale(self, count: u64) -> Resources {
        Resources {
            cpu: self.cpu.saturating_mul(count),
            memory: self.memory.saturating_mul(count),
            network: self.network.saturating_mul(count),
        }
    }

    /// Componentwise `self <= total`.
    pub fn fits_within(&self, total: &Resources) -> bool {
        self.cpu <= total.cpu && self.memory <= total.memory && self.network <= total.network
    }
}

/// Capacity bundle for one host: what it has and what is in use.
///
/// Invariant: `used` never exceeds `total` on any axis. The planner
/// recomputes `used` from the host's apps before every pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceResources {
    pub total: Resources,
    pub used: Resources,
}

impl InstanceResources {
    pub fn with_total(total: Resources) -> Self {
        Self {
            total,
            used: Resources::ZERO,
        }
    }

    /// Would adding `needs` on top of current usage still fit?
    pub fn has_room_for(&self, needs: &Resources) -> bool {
        self.used.saturating_add(*needs).fits_within(&self.total)
    }

    pub fn reserve(&mut self, needs: &Resources) {
        self.used = self.used.saturating_add(*needs);
    }
}

/// One observed replica set: an application at a single version on a single
/// host. The count aggregates identical-version replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunningApp {
    pub version: u64,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stats: Option<AppSample>,
}

/// Latest resource sample reported for a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu: u64,
    pub mem: u64,
    pub net: u64,
}

/// Latest resource and response-time sample reported for one app replica set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSample {
    pub cpu: u64,
    pub mem: u64,
    pub net: u64,
    #[serde(rename = "respPerf", default)]
    pub resp_perf: u64,
}

/// Current observed state of one host, reconstructed purely from check-ins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostRecord {
    pub host_id: String,
    pub instance_type: String,
    pub ip_address: String,
    pub last_seen: DateTime<Utc>,
    pub spot_instance: bool,
    pub available_resources: InstanceResources,
    #[serde(default)]
    pub apps: BTreeMap<String, RunningApp>,
    /// Timestamped host samples from the most recent check-in.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, ResourceSample>,
}

impl HostRecord {
    pub fn new(host_id: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            instance_type: instance_type.into(),
            ip_address: String::new(),
            last_seen: DateTime::<Utc>::MIN_UTC,
            spot_instance: false,
            available_resources: InstanceResources::default(),
            apps: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn has_app(&self, name: &str) -> bool {
        self.apps.contains_key(name)
    }

    pub fn has_resources_for(&self, needs: &Resources) -> bool {
        self.available_resources.has_room_for(needs)
    }
}

/// Host port to container port mapping for one application version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// One configured version of an application: the image to run, how to run
/// and stop it, and what it needs from a host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionConfig {
    #[serde(default)]
    pub version: u64,
    pub image: String,
    #[serde(default)]
    pub run_command: String,
    #[serde(default)]
    pub stop_command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub needs: Resources,
}

/// Operator-declared application record, independent of version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplicationConfiguration {
    pub name: String,
    #[serde(rename = "Type")]
    pub app_type: AppType,
    pub min_deployment: u32,
    pub desired_deployment: u32,
    #[serde(default)]
    pub load_balancer: String,
    #[serde(default)]
    pub network: String,
    /// Version number to the configuration published under it. Keys only
    /// ever grow; versions are never edited in place.
    #[serde(default)]
    pub config: BTreeMap<u64, VersionConfig>,
}

impl ApplicationConfiguration {
    pub fn latest_version(&self) -> Option<u64> {
        self.config.keys().next_back().copied()
    }

    pub fn next_version(&self) -> u64 {
        self.latest_version().map_or(1, |v| v + 1)
    }

    pub fn latest_config(&self) -> Option<&VersionConfig> {
        self.latest_version().and_then(|v| self.config.get(&v))
    }

    pub fn needs_for(&self, version: u64) -> Option<Resources> {
        self.config.get(&version).map(|c| c.needs)
    }
}

/// Lifecycle of a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeState {
    Queued,
    Applying,
    Success,
    Fail,
}

/// What a change instructs: install or remove an app replica on a host, or
/// grow or shrink the fleet itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ChangeType", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all_fields = "PascalCase")]
pub enum ChangeKind {
    AddApp {
        host: String,
        application: String,
        app_version: u64,
        /// Snapshot of the version configuration so the agent can install
        /// without a second round-trip.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_config: Option<VersionConfig>,
    },
    RemoveApp {
        host: String,
        application: String,
        app_version: u64,
    },
    SpawnServer {
        instance_type: String,
        spot_instance: bool,
    },
    TerminateServer {
        host: String,
    },
}

impl ChangeKind {
    /// The host this change targets, if any. Spawns have no host until the
    /// provider hands one back.
    pub fn host(&self) -> Option<&str> {
        match self {
            ChangeKind::AddApp { host, .. }
            | ChangeKind::RemoveApp { host, .. }
            | ChangeKind::TerminateServer { host } => Some(host),
            ChangeKind::SpawnServer { .. } => None,
        }
    }

    pub fn application(&self) -> Option<&str> {
        match self {
            ChangeKind::AddApp { application, .. } | ChangeKind::RemoveApp { application, .. } => {
                Some(application)
            }
            _ => None,
        }
    }

    /// App changes are consumed by host check-ins; server changes by the
    /// provider adapter.
    pub fn is_app_change(&self) -> bool {
        matches!(self, ChangeKind::AddApp { .. } | ChangeKind::RemoveApp { .. })
    }

    pub fn is_server_change(&self) -> bool {
        !self.is_app_change()
    }
}

/// A pending, not-yet-acknowledged instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeRequest {
    pub id: Uuid,
    #[serde(rename = "CreatedTime")]
    pub created: DateTime<Utc>,
    pub state: ChangeState,
    #[serde(flatten)]
    pub kind: ChangeKind,
}
