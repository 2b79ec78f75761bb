//! Host agent check-in protocol
//!
//! A check-in pairs an observation (what the host is running, plus metrics)
//! with an instruction pull: the trainer answers with at most one pending
//! change for that host. Key casing follows the agent wire format.

use crate::model::{AppSample, ChangeRequest, ResourceSample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent-reported status of one app replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Init,
    Running,
    Deploying,
    Dead,
    Unknown,
}

/// One replica as observed by the host agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppObservation {
    pub name: String,
    pub version: u64,
    pub status: AppStatus,
    /// Agent-local replica id, unique per host.
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OsInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

/// The observation half of a check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostInfo {
    pub ip_addr: String,
    #[serde(default)]
    pub os_info: OsInfo,
    #[serde(default)]
    pub apps: Vec<AppObservation>,
}

/// Metrics sampled since the last check-in, keyed by RFC 3339 timestamp.
/// App metrics are further keyed by app name and version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricsBundle {
    #[serde(default)]
    pub host_metrics: BTreeMap<String, ResourceSample>,
    #[serde(default)]
    pub app_metrics: BTreeMap<String, BTreeMap<String, BTreeMap<String, AppSample>>>,
}

/// Body of `POST /checkin?host=<HostId>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckinRequest {
    pub host_info: HostInfo,
    #[serde(default)]
    pub stats: MetricsBundle,
}

/// Check-in reply: the trainer version and at most one change to carry out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckinResponse {
    pub trainer_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkin_request_parses_wire_shape() {
        let body = r#"{
            "HostInfo": {
                "IpAddr": "10.0.0.7",
                "OsInfo": {"Os": "linux", "Arch": "x86_64"},
                "Apps": [
                    {"Name": "web", "Version": 2, "Status": "RUNNING", "Id": "web_1"},
                    {"Name": "worker", "Version": 1, "Status": "DEPLOYING", "Id": "worker_1"}
                ]
            },
            "Stats": {
                "HostMetrics": {
                    "2016-11-01T10:00:00Z": {"cpu": 30, "mem": 40, "net": 10}
                },
                "AppMetrics": {
                    "web": {"2": {"2016-11-01T10:00:00Z": {"cpu": 5, "mem": 6, "net": 1, "respPerf": 120}}}
                }
            }
        }"#;

        let req: CheckinRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.host_info.ip_addr, "10.0.0.7");
        assert_eq!(req.host_info.apps.len(), 2);
        assert_eq!(req.host_info.apps[0].status, AppStatus::Running);
        assert_eq!(req.host_info.apps[1].status, AppStatus::Deploying);
        let sample = &req.stats.app_metrics["web"]["2"]["2016-11-01T10:00:00Z"];
        assert_eq!(sample.resp_perf, 120);
    }

    #[test]
    fn stats_are_optional() {
        let body = r#"{"HostInfo": {"IpAddr": "10.0.0.7"}}"#;
        let req: CheckinRequest = serde_json::from_str(body).unwrap();
        assert!(req.host_info.apps.is_empty());
        assert!(req.stats.host_metrics.is_empty());
    }

    #[test]
    fn empty_response_omits_change() {
        let resp = CheckinResponse {
            trainer_version: "0.1.0".to_string(),
            change: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("Change"));
        assert!(json.contains("TrainerVersion"));
    }
}
