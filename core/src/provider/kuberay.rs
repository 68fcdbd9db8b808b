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

const CRD: CrdConfig = CrdConfig {
    group: "ray.io",
    version: "v1",
    kind: "RayService",
    plural: "rayservices",
};
const ID: &str = "kuberay";
const IMAGE: &str = "rayproject/ray-llm:2.46.0-py311-cu124";
const NAMESPACE: &str = "kuberay-system";
const OPERATOR_SELECTOR: &str = "app.kubernetes.io/name=kuberay-operator";
const RAY_VERSION: &str = "2.46.0";
const WORKER_GROUP: &str = "llm-workers";

// KubeRayProvider

/// KubeRay: a `RayService` running a Ray Serve LLM application backed by vLLM.
pub struct KubeRayProvider;

impl KubeRayProvider {
    fn engine_kwargs(cfg: &DeploymentConfig) -> Map<String, Value> {
        let mut kwargs = Map::new();
        kwargs.insert(
            "tensor_parallel_size".into(),
            json!(cfg.resources.gpu.unwrap_or(1).max(1)),
        );
        if cfg.enforce_eager {
            kwargs.insert("enforce_eager".into(), json!(true));
        }
        if cfg.enable_prefix_caching {
            kwargs.insert("enable_prefix_caching".into(), json!(true));
        }
        if cfg.trust_remote_code {
            kwargs.insert("trust_remote_code".into(), json!(true));
        }
        if let Some(len) = cfg.context_length {
            kwargs.insert("max_model_len".into(), json!(len));
        }
        for (key, val) in &cfg.engine_args {
            kwargs.insert(key.clone(), val.clone());
        }
        kwargs
    }

    fn serve_config(cfg: &DeploymentConfig) -> String {
        let replicas = cfg.replicas.unwrap_or(1);
        let serve = json!({
            "applications": [{
                "name": "llm",
                "route_prefix": "/",
                "import_path": "ray.serve.llm:build_openai_app",
                "args": {
                    "llm_configs": [{
                        "model_loading_config": {
                            "model_id": cfg.served_name(),
                            "model_source": cfg.model_id,
                        },
                        "engine_kwargs": Self::engine_kwargs(cfg),
                        "deployment_config": {
                            "autoscaling_config": {
                                "min_replicas": replicas,
                                "max_replicas": replicas,
                            },
                        },
                    }],
                },
            }],
        });
        serde_yaml::to_string(&serve).unwrap_or_else(|_| serve.to_string())
    }

    fn container(cfg: &DeploymentConfig, name: &str, limits: Map<String, Value>) -> Value {
        let mut container = Map::new();
        container.insert("name".into(), json!(name));
        container.insert("image".into(), json!(IMAGE));
        container.insert("resources".into(), json!({ "limits": limits }));
        if let Some(secret) = &cfg.hf_token_secret {
            container.insert("env".into(), json!([hf_token_env(secret)]));
        }
        Value::Object(container)
    }

    fn cluster_config(cfg: &DeploymentConfig) -> Value {
        let replicas = cfg.replicas.unwrap_or(1);
        let mut head_limits = Map::new();
        head_limits.insert("cpu".into(), json!("2"));
        head_limits.insert("memory".into(), json!("8Gi"));
        let mut head = Self::container(cfg, "ray-head", head_limits);
        if let Some(head) = head.as_object_mut() {
            head.insert(
                "ports".into(),
                json!([
                    {"containerPort": 6379, "name": "gcs-server"},
                    {"containerPort": 8265, "name": "dashboard"},
                    {"containerPort": 8000, "name": "serve"},
                ]),
            );
        }
        let mut worker_limits = Map::new();
        worker_limits.insert(RESOURCE_GPU.into(), json!(cfg.resources.gpu.unwrap_or(1)));
        if let Some(mem) = &cfg.resources.memory {
            worker_limits.insert("memory".into(), json!(mem));
        }
        let worker = Self::container(cfg, "ray-worker", worker_limits);
        json!({
            "rayVersion": RAY_VERSION,
            "headGroupSpec": {
                "rayStartParams": {
                    "dashboard-host": "0.0.0.0",
                    "num-gpus": "0",
                },
                "template": {
                    "spec": {
                        "containers": [head],
                    },
                },
            },
            "workerGroupSpecs": [{
                "groupName": WORKER_GROUP,
                "replicas": replicas,
                "minReplicas": replicas,
                "maxReplicas": replicas,
                "rayStartParams": {},
                "template": {
                    "spec": {
                        "containers": [worker],
                    },
                },
            }],
        })
    }

    fn desired_workers(raw: &Value) -> u32 {
        raw.pointer("/spec/rayClusterConfig/workerGroupSpecs")
            .and_then(Value::as_array)
            .filter(|groups| !groups.is_empty())
            .map(|groups| {
                groups
                    .iter()
                    .map(|group| u32_at(group, "/replicas", 1))
                    .fold(0u32, u32::saturating_add)
            })
            .unwrap_or(1)
    }

    fn model_id(raw: &Value) -> String {
        str_at(raw, "/spec/serveConfigV2")
            .and_then(|serve| serde_yaml::from_str::<Value>(serve).ok())
            .and_then(|serve| {
                let llm = serve.pointer("/applications/0/args/llm_configs/0/model_loading_config")?;
                llm.get("model_source")
                    .or_else(|| llm.get("model_id"))
                    .and_then(Value::as_str)
                    .map(String::from)
            })
            .unwrap_or_default()
    }
}

impl Provider for KubeRayProvider {
    fn id(&self) -> &'static str {
        ID
    }

    fn name(&self) -> &'static str {
        "KubeRay"
    }

    fn description(&self) -> &'static str {
        "Ray Serve LLM on a KubeRay-managed Ray cluster, serving vLLM"
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
            name: "kuberay",
            url: "https://ray-project.github.io/kuberay-helm/",
        }]
    }

    fn helm_charts(&self) -> Vec<HelmChart> {
        vec![HelmChart {
            name: "kuberay-operator",
            chart: "kuberay/kuberay-operator",
            version: Some("1.4.2"),
            namespace: NAMESPACE,
            create_namespace: true,
            values: json!({
                "singleNamespaceInstall": false,
            }),
        }]
    }

    fn validate_config(&self, raw: &Value) -> std::result::Result<DeploymentConfig, Vec<FieldError>> {
        validate_with(raw, |cfg| {
            [
                check_provider(cfg, ID),
                check_engine(cfg, ID, &[Engine::Vllm]),
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
            "spec".into(),
            json!({
                "serveConfigV2": Self::serve_config(cfg),
                "rayClusterConfig": Self::cluster_config(cfg),
            }),
        );
        manifest(&CRD, ID, cfg, body)
    }

    fn parse_status(&self, raw: &Value, now: DateTime<Utc>) -> DeploymentStatus {
        let mut status = DeploymentStatus::from_raw(raw, ID, now);
        let cluster = "/status/activeServiceStatus/rayClusterStatus";
        status.engine = Engine::Vllm;
        status.mode = Mode::Aggregated;
        status.model_id = Self::model_id(raw);
        status.replicas = ReplicaStatus {
            desired: Self::desired_workers(raw),
            ready: u32_at(raw, &format!("{cluster}/readyWorkerReplicas"), 0),
            available: u32_at(raw, &format!("{cluster}/availableWorkerReplicas"), 0),
        };
        status.phase = match str_at(raw, "/status/serviceStatus") {
            Some("Running") => Phase::Running,
            Some(svc) if svc.starts_with("Fail") => Phase::Failed,
            Some(_) => Phase::Pending,
            None => match status.condition("Ready").map(|cond| cond.status) {
                Some(ConditionStatus::True) => Phase::Running,
                _ => Phase::Pending,
            },
        };
        status
    }
}

// Tests

#[cfg(test)]
mod test {
    use crate::test::*;

    use super::*;

    // Functions

    fn config() -> Value {
        json!({
            "name": "llama",
            "namespace": "kuberay-system",
            "modelId": "meta-llama/Llama-3.1-8B-Instruct",
            "servedModelName": "llama-8b",
            "provider": "kuberay",
            "engine": "vllm",
            "replicas": 2,
            "resources": {
                "gpu": 2,
                "memory": "48Gi",
            },
            "hfTokenSecret": "hf-token",
            "enablePrefixCaching": true,
        })
    }

    fn generate(raw: &Value) -> Value {
        let provider = KubeRayProvider;
        let cfg = provider.validate_config(raw).unwrap();
        provider.generate_manifest(&cfg)
    }

    fn serve_config(manifest: &Value) -> Value {
        let serve = manifest["spec"]["serveConfigV2"].as_str().unwrap();
        serde_yaml::from_str(serve).unwrap()
    }

    // Mods

    mod kuberay_provider {
        use super::*;

        mod validate_config {
            use super::*;

            #[test]
            fn ok() {
                let cfg = KubeRayProvider.validate_config(&config()).unwrap();
                assert_eq!(cfg.replicas, Some(2));
            }

            #[test]
            fn disaggregated_rejected() {
                let raw = json!({
                    "name": "llama",
                    "namespace": "kuberay-system",
                    "modelId": "meta-llama/Llama-3.1-8B-Instruct",
                    "provider": "kuberay",
                    "engine": "vllm",
                    "mode": "disaggregated",
                    "prefillReplicas": 1,
                    "decodeReplicas": 1,
                    "prefillGpus": 1,
                    "decodeGpus": 1,
                });
                let errs = KubeRayProvider.validate_config(&raw).unwrap_err();
                assert_eq!(errs.len(), 1);
                assert_eq!(errs[0].path, "mode");
            }

            #[test]
            fn sglang_rejected() {
                let mut raw = config();
                raw["engine"] = json!("sglang");
                let errs = KubeRayProvider.validate_config(&raw).unwrap_err();
                assert_eq!(errs[0].path, "engine");
                assert!(errs[0].message.contains("expected one of: vllm"));
            }
        }

        mod generate_manifest {
            use super::*;

            #[test]
            fn resource() {
                let manifest = generate(&config());
                assert_eq!(manifest["apiVersion"], "ray.io/v1");
                assert_eq!(manifest["kind"], "RayService");
                assert_eq!(manifest["metadata"]["labels"]["llmdeck.dev/provider"], "kuberay");
                let group = &manifest["spec"]["rayClusterConfig"]["workerGroupSpecs"][0];
                assert_eq!(group["groupName"], "llm-workers");
                assert_eq!(group["replicas"], 2);
                assert_eq!(group["maxReplicas"], 2);
                let worker = &group["template"]["spec"]["containers"][0];
                assert_eq!(worker["resources"]["limits"]["nvidia.com/gpu"], 2);
                assert_eq!(worker["resources"]["limits"]["memory"], "48Gi");
                assert_eq!(worker["env"][0]["name"], "HF_TOKEN");
                assert_eq!(worker["env"][0]["valueFrom"]["secretKeyRef"]["name"], "hf-token");
            }

            #[test]
            fn serve_application() {
                let serve = serve_config(&generate(&config()));
                let app = &serve["applications"][0];
                assert_eq!(app["import_path"], "ray.serve.llm:build_openai_app");
                let llm = &app["args"]["llm_configs"][0];
                assert_eq!(llm["model_loading_config"]["model_id"], "llama-8b");
                assert_eq!(
                    llm["model_loading_config"]["model_source"],
                    "meta-llama/Llama-3.1-8B-Instruct"
                );
                assert_eq!(llm["deployment_config"]["autoscaling_config"]["min_replicas"], 2);
                let kwargs = llm["engine_kwargs"].as_object().unwrap();
                assert_eq!(kwargs["tensor_parallel_size"], 2);
                assert_eq!(kwargs["enable_prefix_caching"], true);
                assert!(!kwargs.contains_key("enforce_eager"));
                assert!(!kwargs.contains_key("trust_remote_code"));
                assert!(!kwargs.contains_key("max_model_len"));
            }

            #[test]
            fn engine_args_overlay_kwargs() {
                let mut raw = config();
                raw["contextLength"] = json!(4096);
                raw["engineArgs"] = json!({
                    "max_model_len": 8192,
                    "gpu_memory_utilization": 0.9,
                });
                let serve = serve_config(&generate(&raw));
                let kwargs = &serve["applications"][0]["args"]["llm_configs"][0]["engine_kwargs"];
                assert_eq!(kwargs["max_model_len"], 8192);
                assert_eq!(kwargs["gpu_memory_utilization"], 0.9);
            }

            #[test]
            fn without_secret() {
                let mut raw = config();
                raw.as_object_mut().unwrap().remove("hfTokenSecret");
                let manifest = generate(&raw);
                let head = manifest["spec"]["rayClusterConfig"]["headGroupSpec"]["template"]["spec"]
                    ["containers"][0]
                    .as_object()
                    .unwrap();
                assert!(!head.contains_key("env"));
            }

            #[test]
            fn deterministic() {
                assert_eq!(generate(&config()).to_string(), generate(&config()).to_string());
            }
        }

        mod parse_status {
            use super::*;

            #[test]
            fn round_trip() {
                let mut manifest = generate(&config());
                manifest["status"] = json!({});
                let status = KubeRayProvider.parse_status(&manifest, now());
                assert_eq!(status.engine, Engine::Vllm);
                assert_eq!(status.mode, Mode::Aggregated);
                assert_eq!(status.model_id, "meta-llama/Llama-3.1-8B-Instruct");
                assert_eq!(status.replicas.desired, 2);
                assert_eq!(status.replicas.ready, 0);
                assert_eq!(status.phase, Phase::Pending);
                assert!(status.prefill_replicas.is_none());
            }

            #[test]
            fn desired_saturates() {
                let raw = json!({
                    "spec": {
                        "rayClusterConfig": {
                            "workerGroupSpecs": [
                                {"replicas": u32::MAX},
                                {"replicas": 3},
                            ],
                        },
                    },
                });
                let status = KubeRayProvider.parse_status(&raw, now());
                assert_eq!(status.replicas.desired, u32::MAX);
            }

            #[test]
            fn running() {
                let mut manifest = generate(&config());
                manifest["status"] = json!({
                    "serviceStatus": "Running",
                    "activeServiceStatus": {
                        "rayClusterStatus": {
                            "readyWorkerReplicas": 2,
                            "availableWorkerReplicas": 1,
                        },
                    },
                });
                let status = KubeRayProvider.parse_status(&manifest, now());
                assert_eq!(status.phase, Phase::Running);
                assert_eq!(
                    status.replicas,
                    ReplicaStatus {
                        desired: 2,
                        ready: 2,
                        available: 1,
                    }
                );
            }

            #[test]
            fn failed() {
                let raw = json!({"status": {"serviceStatus": "FailedToGetOrCreateRayCluster"}});
                let status = KubeRayProvider.parse_status(&raw, now());
                assert_eq!(status.phase, Phase::Failed);
            }

            #[test]
            fn ready_condition_without_service_status() {
                let raw = json!({
                    "status": {
                        "conditions": [{"type": "Ready", "status": "True"}],
                    },
                });
                let status = KubeRayProvider.parse_status(&raw, now());
                assert_eq!(status.phase, Phase::Running);
            }

            #[test]
            fn empty_resource() {
                let status = KubeRayProvider.parse_status(&json!({}), now());
                assert_eq!(status.phase, Phase::Pending);
                assert_eq!(status.replicas.desired, 1);
                assert_eq!(status.model_id, "");
            }

            #[test]
            fn garbage_serve_config() {
                let raw = json!({"spec": {"serveConfigV2": "applications: [unterminated"}});
                let status = KubeRayProvider.parse_status(&raw, now());
                assert_eq!(status.model_id, "");
            }

            #[test]
            fn worker_groups_are_summed() {
                let raw = json!({
                    "spec": {
                        "rayClusterConfig": {
                            "workerGroupSpecs": [{"replicas": 2}, {"replicas": 3}, {}],
                        },
                    },
                });
                let status = KubeRayProvider.parse_status(&raw, now());
                assert_eq!(status.replicas.desired, 6);
            }
        }
    }
}
