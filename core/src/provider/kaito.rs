use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::{
    config::{check_engine, check_mode, check_provider, DeploymentConfig, Engine, FieldError, Mode},
    kube::CrdConfig,
    status::{str_at, u32_at, ConditionStatus, DeploymentStatus, Phase, ReplicaStatus},
    RESOURCE_GPU,
};

use super::{hf_token_env, manifest, validate_with, HelmChart, HelmRepo, Provider};

// Consts

const CONDITION_INFERENCE_READY: &str = "InferenceReady";
const CONDITION_SUCCEEDED: &str = "WorkspaceSucceeded";
const CRD: CrdConfig = CrdConfig {
    group: "kaito.sh",
    version: "v1beta1",
    kind: "Workspace",
    plural: "workspaces",
};
const ID: &str = "kaito";
const IMAGE_CPU: &str = "ghcr.io/ggml-org/llama.cpp:server";
const IMAGE_GPU: &str = "ghcr.io/ggml-org/llama.cpp:server-cuda";
const NAMESPACE: &str = "kaito-workspace";
const OPERATOR_SELECTOR: &str = "app.kubernetes.io/name=workspace";
const PORT: u16 = 8080;
const SELECTOR_LABEL: &str = "apps";

// KaitoProvider

/// KAITO: a `Workspace` whose inference template runs the llama.cpp server, on CPU or GPU.
pub struct KaitoProvider;

impl KaitoProvider {
    /// llama.cpp server flags; `engineArgs` overlay them, `true` as a bare flag and `false` removing it.
    fn args(cfg: &DeploymentConfig) -> Vec<String> {
        let mut flags: BTreeMap<String, Option<String>> = BTreeMap::new();
        flags.insert("--hf-repo".into(), Some(cfg.model_id.clone()));
        flags.insert("--alias".into(), Some(cfg.served_name().into()));
        flags.insert("--host".into(), Some("0.0.0.0".into()));
        flags.insert("--port".into(), Some(PORT.to_string()));
        if let Some(len) = cfg.context_length {
            flags.insert("--ctx-size".into(), Some(len.to_string()));
        }
        if Self::gpus(cfg) > 0 {
            flags.insert("--n-gpu-layers".into(), Some("999".into()));
        }
        for (key, val) in &cfg.engine_args {
            let flag = format!("--{}", key.trim_start_matches('-'));
            match val {
                Value::Bool(true) => {
                    flags.insert(flag, None);
                }
                Value::Bool(false) => {
                    flags.remove(&flag);
                }
                Value::String(val) => {
                    flags.insert(flag, Some(val.clone()));
                }
                val => {
                    flags.insert(flag, Some(val.to_string()));
                }
            }
        }
        flags
            .into_iter()
            .flat_map(|(flag, val)| std::iter::once(flag).chain(val))
            .collect()
    }

    fn container(cfg: &DeploymentConfig) -> Value {
        let gpus = Self::gpus(cfg);
        let mut limits = Map::new();
        if gpus > 0 {
            limits.insert(RESOURCE_GPU.into(), json!(gpus));
        }
        if let Some(mem) = &cfg.resources.memory {
            limits.insert("memory".into(), json!(mem));
        }
        let mut container = Map::new();
        container.insert("name".into(), json!("llama-server"));
        container.insert(
            "image".into(),
            json!(if gpus > 0 { IMAGE_GPU } else { IMAGE_CPU }),
        );
        container.insert("args".into(), json!(Self::args(cfg)));
        container.insert(
            "ports".into(),
            json!([{"containerPort": PORT, "name": "http"}]),
        );
        container.insert(
            "readinessProbe".into(),
            json!({
                "httpGet": {
                    "path": "/health",
                    "port": PORT,
                },
            }),
        );
        if !limits.is_empty() {
            container.insert("resources".into(), json!({ "limits": limits }));
        }
        if let Some(secret) = &cfg.hf_token_secret {
            container.insert("env".into(), json!([hf_token_env(secret)]));
        }
        Value::Object(container)
    }

    fn gpus(cfg: &DeploymentConfig) -> u32 {
        cfg.resources.gpu.unwrap_or(0)
    }

    fn model_id(raw: &Value) -> String {
        let args = raw
            .pointer("/inference/template/spec/containers/0/args")
            .and_then(Value::as_array);
        args.and_then(|args| {
            args.iter()
                .position(|arg| arg.as_str() == Some("--hf-repo"))
                .and_then(|idx| args.get(idx + 1))
                .and_then(Value::as_str)
        })
        .or_else(|| str_at(raw, "/inference/preset/name"))
        .unwrap_or_default()
        .into()
    }
}

impl Provider for KaitoProvider {
    fn id(&self) -> &'static str {
        ID
    }

    fn name(&self) -> &'static str {
        "KAITO"
    }

    fn description(&self) -> &'static str {
        "Kubernetes AI Toolchain Operator workspace running the llama.cpp server, CPU-only or GPU-accelerated"
    }

    fn default_namespace(&self) -> &'static str {
        NAMESPACE
    }

    fn operator_selector(&self) -> &'static str {
        OPERATOR_SELECTOR
    }

    fn crd(&self) -> CrdConfig {
        CRD
    }

    fn helm_repos(&self) -> Vec<HelmRepo> {
        vec![HelmRepo {
            name: "kaito",
            url: "https://azure.github.io/kaito/charts/kaito",
        }]
    }

    fn helm_charts(&self) -> Vec<HelmChart> {
        vec![HelmChart {
            name: "kaito-workspace",
            chart: "kaito/workspace",
            version: Some("0.6.0"),
            namespace: NAMESPACE,
            create_namespace: true,
            values: json!({}),
        }]
    }

    fn validate_config(&self, raw: &Value) -> std::result::Result<DeploymentConfig, Vec<FieldError>> {
        validate_with(raw, |cfg| {
            [
                check_provider(cfg, ID),
                check_engine(cfg, ID, &[Engine::Llamacpp]),
                check_mode(cfg, ID, &[Mode::Aggregated]),
            ]
            .into_iter()
            .flatten()
            .collect()
        })
    }

    fn generate_manifest(&self, cfg: &DeploymentConfig) -> Value {
        let mut body = Map::new();
        body.insert(
            "resource".into(),
            json!({
                "count": cfg.replicas.unwrap_or(1),
                "labelSelector": {
                    "matchLabels": {
                        SELECTOR_LABEL: cfg.name,
                    },
                },
            }),
        );
        body.insert(
            "inference".into(),
            json!({
                "template": {
                    "spec": {
                        "containers": [Self::container(cfg)],
                    },
                },
            }),
        );
        manifest(&CRD, ID, cfg, body)
    }

    fn parse_status(&self, raw: &Value, now: DateTime<Utc>) -> DeploymentStatus {
        let mut status = DeploymentStatus::from_raw(raw, ID, now);
        let desired = u32_at(raw, "/resource/count", 1);
        let is = |kind: &str, expected: ConditionStatus| {
            status.condition(kind).map(|cond| cond.status) == Some(expected)
        };
        let ready = if is(CONDITION_INFERENCE_READY, ConditionStatus::True) {
            desired
        } else {
            0
        };
        let failed = status.conditions.iter().any(|cond| {
            cond.status == ConditionStatus::False
                && cond
                    .reason
                    .as_deref()
                    .is_some_and(|reason| reason.ends_with("Failed"))
        });
        let phase = if is(CONDITION_SUCCEEDED, ConditionStatus::True) {
            Phase::Running
        } else if failed {
            Phase::Failed
        } else {
            Phase::Pending
        };
        status.engine = Engine::Llamacpp;
        status.mode = Mode::Aggregated;
        status.model_id = Self::model_id(raw);
        status.phase = phase;
        status.replicas = ReplicaStatus {
            desired,
            ready,
            available: ready,
        };
        status
    }
}

// Tests
