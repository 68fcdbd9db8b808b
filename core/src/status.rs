use std::{ops::Add, str::FromStr};

use chrono::{DateTime, Utc};
use enum_display::EnumDisplay;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Engine, Mode};

// Phase

#[derive(Clone, Copy, Debug, Default, Deserialize, EnumDisplay, Eq, PartialEq, Serialize)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Failed,
    Unknown,
}

impl Phase {
    /// Matches a raw phase case-insensitively; anything unrecognized is `Unknown`.
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

// ConditionStatus

#[derive(Clone, Copy, Debug, Default, Deserialize, EnumDisplay, Eq, PartialEq, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl FromStr for ConditionStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "True" => Ok(Self::True),
            "False" => Ok(Self::False),
            "Unknown" => Ok(Self::Unknown),
            _ => Err(()),
        }
    }
}

// Condition

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn from_raw(raw: &Value) -> Self {
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(String::from);
        Self {
            kind: text("type").unwrap_or_default(),
            status: raw
                .get("status")
                .and_then(Value::as_str)
                .and_then(|status| status.parse().ok())
                .unwrap_or_default(),
            reason: text("reason"),
            message: text("message"),
            last_transition_time: text("lastTransitionTime"),
        }
    }
}

// ReplicaStatus

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
}

impl Add for ReplicaStatus {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self {
            desired: self.desired.saturating_add(other.desired),
            ready: self.ready.saturating_add(other.ready),
            available: self.available.saturating_add(other.available),
        }
    }
}

// RoleReplicaStatus

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleReplicaStatus {
    pub desired: u32,
    pub ready: u32,
}

impl From<ReplicaStatus> for RoleReplicaStatus {
    fn from(replicas: ReplicaStatus) -> Self {
        Self {
            desired: replicas.desired,
            ready: replicas.ready,
        }
    }
}

// PodInfo

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    pub restarts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl From<Pod> for PodInfo {
    fn from(pod: Pod) -> Self {
        let status = pod.status.unwrap_or_default();
        let containers = status.container_statuses.unwrap_or_default();
        Self {
            name: pod.metadata.name.unwrap_or_default(),
            phase: status.phase.unwrap_or_else(|| Phase::Unknown.to_string()),
            ready: !containers.is_empty() && containers.iter().all(|cont| cont.ready),
            restarts: containers.iter().map(|cont| cont.restart_count).fold(0, i32::saturating_add),
            node_name: pod.spec.and_then(|spec| spec.node_name),
        }
    }
}

// DeploymentStatus

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub name: String,
    pub namespace: String,
    pub model_id: String,
    pub engine: Engine,
    pub mode: Mode,
    pub provider: String,
    pub phase: Phase,
    pub replicas: ReplicaStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill_replicas: Option<RoleReplicaStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_replicas: Option<RoleReplicaStatus>,
    pub conditions: Vec<Condition>,
    pub pods: Vec<PodInfo>,
    pub created_at: DateTime<Utc>,
    pub frontend_service: String,
}

impl DeploymentStatus {
    /// Status with the fields every runtime shares read from `raw`, the rest defaulted.
    ///
    /// Providers refine engine, mode, phase and replicas afterwards.
    pub fn from_raw(raw: &Value, provider: &str, now: DateTime<Utc>) -> Self {
        let name = str_at(raw, "/metadata/name").unwrap_or_default();
        Self {
            frontend_service: frontend_service(name),
            name: name.into(),
            namespace: str_at(raw, "/metadata/namespace")
                .unwrap_or_default()
                .into(),
            model_id: String::new(),
            engine: Engine::default(),
            mode: Mode::default(),
            provider: provider.into(),
            phase: Phase::Pending,
            replicas: ReplicaStatus {
                desired: 1,
                ..Default::default()
            },
            prefill_replicas: None,
            decode_replicas: None,
            conditions: conditions(raw),
            pods: vec![],
            created_at: str_at(raw, "/metadata/creationTimestamp")
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(now),
        }
    }

    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|cond| cond.kind == kind)
    }
}

// Functions

pub fn frontend_service(name: &str) -> String {
    format!("{name}-frontend")
}

pub(crate) fn u32_at(raw: &Value, pointer: &str, default: u32) -> u32 {
    raw.pointer(pointer)
        .and_then(Value::as_u64)
        .and_then(|val| u32::try_from(val).ok())
        .unwrap_or(default)
}

pub(crate) fn str_at<'a>(raw: &'a Value, pointer: &str) -> Option<&'a str> {
    raw.pointer(pointer).and_then(Value::as_str)
}

fn conditions(raw: &Value) -> Vec<Condition> {
    raw.pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conds| conds.iter().map(Condition::from_raw).collect())
        .unwrap_or_default()
}

// Tests

#[cfg(test)]
mod test {
    use k8s_openapi::api::core::v1::{ContainerStatus, PodSpec, PodStatus};
    use kube::api::ObjectMeta;
    use serde_json::json;

    use crate::test::*;

    use super::*;

    // Mods

    mod condition {
        use super::*;

        mod from_raw {
            use super::*;

            #[test]
            fn full() {
                let raw = json!({
                    "type": "Ready",
                    "status": "True",
                    "reason": "AllServicesReady",
                    "message": "all services are ready",
                    "lastTransitionTime": "2025-06-01T10:00:00Z",
                });
                let cond = Condition::from_raw(&raw);
                let expected = Condition {
                    kind: "Ready".into(),
                    status: ConditionStatus::True,
                    reason: Some("AllServicesReady".into()),
                    message: Some("all services are ready".into()),
                    last_transition_time: Some("2025-06-01T10:00:00Z".into()),
                };
                assert_eq!(cond, expected);
            }

            #[test]
            fn status_defaults_to_unknown() {
                let cond = Condition::from_raw(&json!({"type": "Ready"}));
                assert_eq!(cond.status, ConditionStatus::Unknown);
                assert!(cond.reason.is_none());
            }

            #[test]
            fn garbage_status() {
                let cond = Condition::from_raw(&json!({"type": "Ready", "status": "maybe"}));
                assert_eq!(cond.status, ConditionStatus::Unknown);
            }
        }
    }

    mod deployment_status {
        use super::*;

        mod from_raw {
            use super::*;

            #[test]
            fn empty_resource() {
                let now = now();
                let status = DeploymentStatus::from_raw(&json!({}), "dynamo", now);
                assert_eq!(status.name, "");
                assert_eq!(status.phase, Phase::Pending);
                assert_eq!(status.replicas.desired, 1);
                assert_eq!(status.replicas.ready, 0);
                assert_eq!(status.created_at, now);
                assert!(status.conditions.is_empty());
                assert_eq!(status.frontend_service, "-frontend");
            }

            #[test]
            fn metadata_and_conditions_in_source_order() {
                let raw = json!({
                    "metadata": {
                        "name": "qwen",
                        "namespace": "dynamo-system",
                        "creationTimestamp": "2025-06-01T10:00:00Z",
                    },
                    "status": {
                        "conditions": [
                            {"type": "Ready", "status": "False"},
                            {"type": "Available", "status": "True"},
                        ],
                    },
                });
                let status = DeploymentStatus::from_raw(&raw, "dynamo", now());
                assert_eq!(status.name, "qwen");
                assert_eq!(status.namespace, "dynamo-system");
                assert_eq!(status.frontend_service, "qwen-frontend");
                assert_eq!(status.created_at, ts("2025-06-01T10:00:00Z"));
                let kinds: Vec<&str> = status.conditions.iter().map(|c| c.kind.as_str()).collect();
                assert_eq!(kinds, ["Ready", "Available"]);
                assert_eq!(
                    status.condition("Available").map(|c| c.status),
                    Some(ConditionStatus::True)
                );
            }

            #[test]
            fn unparseable_timestamp() {
                let now = now();
                let raw = json!({"metadata": {"creationTimestamp": "yesterday"}});
                let status = DeploymentStatus::from_raw(&raw, "dynamo", now);
                assert_eq!(status.created_at, now);
            }
        }
    }

    mod phase {
        use super::*;

        #[test]
        fn case_insensitive() {
            assert_eq!(Phase::from_raw("running"), Phase::Running);
            assert_eq!(Phase::from_raw("Failed"), Phase::Failed);
        }

        #[test]
        fn unrecognized() {
            assert_eq!(Phase::from_raw("successful"), Phase::Unknown);
        }
    }

    mod pod_info {
        use super::*;

        #[test]
        fn ready_pod() {
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some("qwen-vllmworker-0".into()),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    node_name: Some("gpu-node-1".into()),
                    ..Default::default()
                }),
                status: Some(PodStatus {
                    phase: Some("Running".into()),
                    container_statuses: Some(vec![
                        ContainerStatus {
                            ready: true,
                            restart_count: 1,
                            ..Default::default()
                        },
                        ContainerStatus {
                            ready: true,
                            restart_count: 2,
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            };
            let info = PodInfo::from(pod);
            let expected = PodInfo {
                name: "qwen-vllmworker-0".into(),
                phase: "Running".into(),
                ready: true,
                restarts: 3,
                node_name: Some("gpu-node-1".into()),
            };
            assert_eq!(info, expected);
        }

        #[test]
        fn pod_without_status() {
            let info = PodInfo::from(Pod::default());
            assert_eq!(info.phase, "Unknown");
            assert!(!info.ready);
            assert_eq!(info.restarts, 0);
        }
    }

    mod replica_status {
        use super::*;

        #[test]
        fn add() {
            let a = ReplicaStatus {
                desired: 1,
                ready: 1,
                available: 0,
            };
            let b = ReplicaStatus {
                desired: 3,
                ready: 2,
                available: 2,
            };
            let expected = ReplicaStatus {
                desired: 4,
                ready: 3,
                available: 2,
            };
            assert_eq!(a + b, expected);
        }

        #[test]
        fn add_saturates() {
            let a = ReplicaStatus {
                desired: u32::MAX,
                ready: 1,
                available: u32::MAX,
            };
            let b = ReplicaStatus {
                desired: 1,
                ready: 1,
                available: u32::MAX,
            };
            let expected = ReplicaStatus {
                desired: u32::MAX,
                ready: 2,
                available: u32::MAX,
            };
            assert_eq!(a + b, expected);
        }
    }
}
