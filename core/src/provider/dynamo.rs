use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::{
    config::{check_engine, check_provider, DeploymentConfig, Engine, FieldError, Mode, RouterMode},
    kube::CrdConfig,
    status::{str_at, u32_at, DeploymentStatus, Phase, ReplicaStatus},
    RESOURCE_GPU,
};

use super::{manifest, validate_with, HelmChart, HelmRepo, Provider};

// Consts

const CRD: CrdConfig = CrdConfig {
    group: "nvidia.com",
    version: "v1alpha1",
    kind: "DynamoGraphDeployment",
    plural: "dynamographdeployments",
};
const ENGINES: [Engine; 3] = [Engine::Vllm, Engine::Sglang, Engine::Trtllm];
const FRONTEND: &str = "Frontend";
const ID: &str = "dynamo";
const NAMESPACE: &str = "dynamo-system";
const OPERATOR_SELECTOR: &str = "app.kubernetes.io/name=dynamo-operator";
const PLATFORM_VERSION: &str = "0.4.1";

const FAMILIES: [WorkerKeys; 3] = [
    WorkerKeys {
        engine: Engine::Vllm,
        aggregated: "VllmWorker",
        prefill: "VllmPrefillWorker",
        decode: "VllmDecodeWorker",
    },
    WorkerKeys {
        engine: Engine::Sglang,
        aggregated: "SglangWorker",
        prefill: "SglangPrefillWorker",
        decode: "SglangDecodeWorker",
    },
    WorkerKeys {
        engine: Engine::Trtllm,
        aggregated: "TrtllmWorker",
        prefill: "TrtllmPrefillWorker",
        decode: "TrtllmDecodeWorker",
    },
];

// WorkerKeys

/// Spec keys of the workers of one engine family.
struct WorkerKeys {
    engine: Engine,
    aggregated: &'static str,
    prefill: &'static str,
    decode: &'static str,
}

impl WorkerKeys {
    /// Unsupported engines get the vLLM-shaped keys so that generation stays total.
    fn of(engine: Engine) -> &'static Self {
        match engine {
            Engine::Sglang => &FAMILIES[1],
            Engine::Trtllm => &FAMILIES[2],
            Engine::Vllm | Engine::Llamacpp => &FAMILIES[0],
        }
    }
}

// WorkerRole

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WorkerRole {
    Aggregated,
    Prefill,
    Decode,
}

// DynamoProvider

/// NVIDIA Dynamo: `DynamoGraphDeployment` with a frontend and one or two worker pools.
pub struct DynamoProvider;

impl DynamoProvider {
    fn frontend_spec(cfg: &DeploymentConfig) -> Value {
        let mut spec = Map::new();
        spec.insert("replicas".into(), json!(1));
        let router = cfg.effective_router_mode();
        if router != RouterMode::None {
            spec.insert("router-mode".into(), json!(router.as_str()));
        }
        Value::Object(spec)
    }

    fn worker_spec(
        cfg: &DeploymentConfig,
        keys: &WorkerKeys,
        role: WorkerRole,
        replicas: u32,
        gpus: u32,
    ) -> Value {
        let mut spec = Map::new();
        spec.insert("model-path".into(), json!(cfg.model_id));
        spec.insert("served-model-name".into(), json!(cfg.served_name()));
        spec.insert("replicas".into(), json!(replicas));
        let mut limits = Map::new();
        limits.insert(RESOURCE_GPU.into(), json!(gpus));
        if let Some(mem) = &cfg.resources.memory {
            limits.insert("memory".into(), json!(mem));
        }
        spec.insert("resources".into(), json!({ "limits": limits }));
        if let Some(secret) = &cfg.hf_token_secret {
            spec.insert("envFromSecret".into(), json!(secret));
        }
        let vllm_style = keys.engine == Engine::Vllm;
        match role {
            WorkerRole::Aggregated => {}
            WorkerRole::Prefill if vllm_style => {
                spec.insert("is-prefill-worker".into(), json!(true));
            }
            WorkerRole::Decode if vllm_style => {}
            WorkerRole::Prefill => {
                spec.insert("disaggregation-mode".into(), json!("prefill"));
            }
            WorkerRole::Decode => {
                spec.insert("disaggregation-mode".into(), json!("decode"));
            }
        }
        if cfg.enforce_eager {
            spec.insert("enforce-eager".into(), json!(true));
        }
        if cfg.enable_prefix_caching {
            spec.insert("enable-prefix-caching".into(), json!(true));
        }
        if cfg.trust_remote_code {
            spec.insert("trust-remote-code".into(), json!(true));
        }
        if let Some(len) = cfg.context_length {
            spec.insert("max-model-len".into(), json!(len));
        }
        for (key, val) in &cfg.engine_args {
            spec.insert(key.clone(), val.clone());
        }
        Value::Object(spec)
    }

    fn worker_replicas(raw: &Value, key: &str) -> ReplicaStatus {
        ReplicaStatus {
            desired: u32_at(raw, &format!("/spec/{key}/replicas"), 1),
            ready: u32_at(raw, &format!("/status/services/{key}/readyReplicas"), 0),
            available: u32_at(raw, &format!("/status/services/{key}/availableReplicas"), 0),
        }
    }
}

impl Provider for DynamoProvider {
    fn id(&self) -> &'static str {
        ID
    }

    fn name(&self) -> &'static str {
        "NVIDIA Dynamo"
    }

    fn description(&self) -> &'static str {
        "GPU-native inference platform serving vLLM, SGLang and TensorRT-LLM, aggregated or with disaggregated prefill/decode"
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
        vec![]
    }

    fn helm_charts(&self) -> Vec<HelmChart> {
        vec![
            HelmChart {
                name: "dynamo-crds",
                chart: "https://helm.ngc.nvidia.com/nvidia/ai-dynamo/charts/dynamo-crds-0.4.1.tgz",
                version: None,
                namespace: "default",
                create_namespace: false,
                values: json!({}),
            },
            HelmChart {
                name: "dynamo-platform",
                chart: "https://helm.ngc.nvidia.com/nvidia/ai-dynamo/charts/dynamo-platform-0.4.1.tgz",
                version: None,
                namespace: NAMESPACE,
                create_namespace: true,
                values: json!({
                    "dynamo-operator.image.tag": PLATFORM_VERSION,
                }),
            },
        ]
    }

    fn validate_config(&self, raw: &Value) -> std::result::Result<DeploymentConfig, Vec<FieldError>> {
        validate_with(raw, |cfg| {
            [check_provider(cfg, ID), check_engine(cfg, ID, &ENGINES)]
                .into_iter()
                .flatten()
                .collect()
        })
    }

    fn generate_manifest(&self, cfg: &DeploymentConfig) -> Value {
        let keys = WorkerKeys::of(cfg.engine);
        let mut spec = Map::new();
        spec.insert(FRONTEND.into(), Self::frontend_spec(cfg));
        match cfg.mode {
            Mode::Aggregated => {
                let worker = Self::worker_spec(
                    cfg,
                    keys,
                    WorkerRole::Aggregated,
                    cfg.replicas.unwrap_or(1),
                    cfg.resources.gpu.unwrap_or(1),
                );
                spec.insert(keys.aggregated.into(), worker);
            }
            Mode::Disaggregated => {
                let prefill = Self::worker_spec(
                    cfg,
                    keys,
                    WorkerRole::Prefill,
                    cfg.prefill_replicas.unwrap_or(1),
                    cfg.prefill_gpus.unwrap_or(1),
                );
                let decode = Self::worker_spec(
                    cfg,
                    keys,
                    WorkerRole::Decode,
                    cfg.decode_replicas.unwrap_or(1),
                    cfg.decode_gpus.unwrap_or(1),
                );
                spec.insert(keys.prefill.into(), prefill);
                spec.insert(keys.decode.into(), decode);
            }
        }
        let mut body = Map::new();
        body.insert("spec".into(), Value::Object(spec));
        manifest(&CRD, ID, cfg, body)
    }

    fn parse_status(&self, raw: &Value, now: DateTime<Utc>) -> DeploymentStatus {
        let mut status = DeploymentStatus::from_raw(raw, ID, now);
        let has = |key: &str| raw.pointer(&format!("/spec/{key}")).is_some();
        let model_path = |key: &str| str_at(raw, &format!("/spec/{key}/model-path"));
        if let Some(keys) = FAMILIES.iter().find(|keys| has(keys.prefill) || has(keys.decode)) {
            let prefill = Self::worker_replicas(raw, keys.prefill);
            let decode = Self::worker_replicas(raw, keys.decode);
            status.engine = keys.engine;
            status.mode = Mode::Disaggregated;
            status.replicas = prefill + decode;
            status.prefill_replicas = Some(prefill.into());
            status.decode_replicas = Some(decode.into());
            status.model_id = model_path(keys.prefill)
                .or_else(|| model_path(keys.decode))
                .unwrap_or_default()
                .into();
        } else if let Some(keys) = FAMILIES.iter().find(|keys| has(keys.aggregated)) {
            status.engine = keys.engine;
            status.replicas = Self::worker_replicas(raw, keys.aggregated);
            status.model_id = model_path(keys.aggregated).unwrap_or_default().into();
        }
        status.phase = str_at(raw, "/status/phase")
            .map(Phase::from_raw)
            .unwrap_or(Phase::Pending);
        status
    }
}

// Tests
