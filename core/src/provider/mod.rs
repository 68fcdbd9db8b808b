use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::{
    config::{DeploymentConfig, FieldError},
    err::is_not_found,
    kube::{CrdConfig, KubeClient, MANAGER},
    status::DeploymentStatus,
    ANNOT_CHECKSUM, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_PROVIDER,
};

// Consts

const HF_TOKEN: &str = "HF_TOKEN";

// Mods

pub mod dynamo;
pub mod kaito;
pub mod kuberay;

// Data structs

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepo {
    pub name: &'static str,
    pub url: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    pub name: &'static str,
    pub chart: &'static str,
    pub version: Option<&'static str>,
    pub namespace: &'static str,
    pub create_namespace: bool,
    pub values: Value,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStep {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub description: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    pub installed: bool,
    pub crd_found: bool,
    pub operator_running: bool,
    pub message: String,
}

// Traits

/// Everything that differs between serving runtimes.
pub trait Provider: Send + Sync {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn default_namespace(&self) -> &'static str;

    fn operator_selector(&self) -> &'static str;

    fn crd(&self) -> CrdConfig;

    fn helm_repos(&self) -> Vec<HelmRepo>;

    fn helm_charts(&self) -> Vec<HelmChart>;

    fn installation_steps(&self) -> Vec<InstallationStep> {
        helm_installation_steps(&self.helm_repos(), &self.helm_charts())
    }

    fn validate_config(&self, raw: &Value) -> std::result::Result<DeploymentConfig, Vec<FieldError>>;

    fn generate_manifest(&self, cfg: &DeploymentConfig) -> Value;

    fn parse_status(&self, raw: &Value, now: DateTime<Utc>) -> DeploymentStatus;
}

// Functions

/// Checks the provider's CRD and operator without ever failing: cluster errors resolve to `false`.
#[instrument(skip(provider, kube), fields(provider.id = provider.id()))]
pub async fn check_installation<KUBE: KubeClient>(
    provider: &dyn Provider,
    kube: &KUBE,
) -> InstallationStatus {
    let crd = provider.crd();
    let ns = provider.default_namespace();
    let (crd_found, crd_err) = match kube.list_custom(&crd, ns).await {
        Ok(_) => (true, None),
        Err(err) if is_not_found(&err) => {
            debug!("crd not found");
            (false, None)
        }
        Err(err) => {
            warn!("failed to check crd: {err}");
            (false, Some(err))
        }
    };
    let operator_running = match kube.list_pods(ns, provider.operator_selector()).await {
        Ok(pods) => pods.iter().any(is_running),
        Err(err) => {
            debug!("failed to list operator pods: {err}");
            false
        }
    };
    let message = if let Some(err) = crd_err {
        format!(
            "{} CRD `{}.{}` could not be checked: {err}",
            provider.name(),
            crd.plural,
            crd.group
        )
    } else if !crd_found {
        format!(
            "{} CRD `{}.{}` is not installed",
            provider.name(),
            crd.plural,
            crd.group
        )
    } else if !operator_running {
        format!(
            "{} operator is not running in namespace `{ns}`",
            provider.name()
        )
    } else {
        format!("{} is installed and running", provider.name())
    };
    InstallationStatus {
        installed: crd_found && operator_running,
        crd_found,
        operator_running,
        message,
    }
}

pub fn checksum(body: &Value) -> String {
    let mut digest = Sha256::new();
    digest.update(body.to_string().as_bytes());
    hex::encode(digest.finalize())
}

pub(crate) fn helm_installation_steps(
    repos: &[HelmRepo],
    charts: &[HelmChart],
) -> Vec<InstallationStep> {
    let repo_steps = repos.iter().map(|repo| InstallationStep {
        title: format!("Add the {} Helm repository", repo.name),
        command: Some(format!(
            "helm repo add {} {} && helm repo update",
            repo.name, repo.url
        )),
        description: format!("Registers {} as `{}`.", repo.url, repo.name),
    });
    let chart_steps = charts.iter().map(|chart| {
        let mut cmd = format!(
            "helm upgrade --install {} {} -n {}",
            chart.name, chart.chart, chart.namespace
        );
        if chart.create_namespace {
            cmd.push_str(" --create-namespace");
        }
        if let Some(version) = chart.version {
            cmd.push_str(&format!(" --version {version}"));
        }
        if let Some(values) = chart.values.as_object() {
            for (key, val) in values {
                let val = val.as_str().map(String::from).unwrap_or_else(|| val.to_string());
                cmd.push_str(&format!(" --set {key}={val}"));
            }
        }
        InstallationStep {
            title: format!("Install the {} chart", chart.name),
            command: Some(cmd),
            description: format!(
                "Installs release `{}` into namespace `{}`.",
                chart.name, chart.namespace
            ),
        }
    });
    repo_steps.chain(chart_steps).collect()
}

/// Wraps a manifest body with type and metadata, labelled and stamped with the body checksum.
pub(crate) fn manifest(
    crd: &CrdConfig,
    provider: &str,
    cfg: &DeploymentConfig,
    body: Map<String, Value>,
) -> Value {
    let mut manifest = Map::new();
    manifest.insert("apiVersion".into(), Value::String(crd.api_version()));
    manifest.insert("kind".into(), Value::String(crd.kind.into()));
    manifest.insert(
        "metadata".into(),
        json!({
            "name": cfg.name,
            "namespace": cfg.namespace,
            "labels": {
                LABEL_INSTANCE: cfg.name,
                LABEL_MANAGED_BY: MANAGER,
                LABEL_PROVIDER: provider,
            },
            "annotations": {
                ANNOT_CHECKSUM: checksum(&Value::Object(body.clone())),
            },
        }),
    );
    manifest.extend(body);
    Value::Object(manifest)
}

pub(crate) fn hf_token_env(secret: &str) -> Value {
    json!({
        "name": HF_TOKEN,
        "valueFrom": {
            "secretKeyRef": {
                "name": secret,
                "key": HF_TOKEN,
            },
        },
    })
}

pub(crate) fn validate_with<CHECK: FnOnce(&DeploymentConfig) -> Vec<FieldError>>(
    raw: &Value,
    check: CHECK,
) -> std::result::Result<DeploymentConfig, Vec<FieldError>> {
    let cfg = DeploymentConfig::from_raw(raw)?;
    let mut errs = cfg.check();
    errs.extend(check(&cfg));
    if errs.is_empty() {
        Ok(cfg)
    } else {
        errs.sort();
        errs.dedup();
        Err(errs)
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

// Tests

#[cfg(test)]
mod test {
    use k8s_openapi::api::core::v1::PodStatus;
    use mockall::predicate::*;

    use crate::{kube::MockKubeClient, test::*};

    use super::{dynamo::DynamoProvider, *};

    // Mods

    mod check_installation {
        use super::*;

        // Mocks

        struct Mocks {
            crd_code: Option<u16>,
            pods: Option<Vec<&'static str>>,
        }

        impl Default for Mocks {
            fn default() -> Self {
                Self {
                    crd_code: None,
                    pods: Some(vec!["Running"]),
                }
            }
        }

        // Tests

        async fn test(mocks: Mocks) -> InstallationStatus {
            init_tracer();
            let provider = DynamoProvider;
            let crd_code = mocks.crd_code;
            let mut kube = MockKubeClient::new();
            kube.expect_list_custom()
                .withf(|crd, ns| crd.kind == "DynamoGraphDeployment" && ns == "dynamo-system")
                .times(1)
                .returning(move |_, _| match crd_code {
                    None => async_ok(vec![]),
                    Some(code) => async_err(api_error(code)),
                });
            kube.expect_list_pods()
                .with(eq("dynamo-system"), eq("app.kubernetes.io/name=dynamo-operator"))
                .times(1)
                .returning({
                    let phases = mocks.pods.clone();
                    move |_, _| match &phases {
                        Some(phases) => {
                            let pods = phases
                                .iter()
                                .map(|phase| Pod {
                                    status: Some(PodStatus {
                                        phase: Some((*phase).into()),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                })
                                .collect();
                            async_ok(pods)
                        }
                        None => async_err(api_error(404)),
                    }
                });
            check_installation(&provider, &kube).await
        }

        #[tokio::test]
        async fn installed_and_running() {
            let status = test(Mocks::default()).await;
            assert!(status.installed);
            assert!(status.crd_found);
            assert!(status.operator_running);
            assert_eq!(status.message, "NVIDIA Dynamo is installed and running");
        }

        #[tokio::test]
        async fn crd_not_found() {
            let mocks = Mocks {
                crd_code: Some(404),
                ..Default::default()
            };
            let status = test(mocks).await;
            assert!(!status.installed);
            assert!(!status.crd_found);
            assert!(status.operator_running);
            assert_eq!(
                status.message,
                "NVIDIA Dynamo CRD `dynamographdeployments.nvidia.com` is not installed"
            );
        }

        #[tokio::test]
        async fn crd_check_forbidden() {
            let mocks = Mocks {
                crd_code: Some(403),
                ..Default::default()
            };
            let status = test(mocks).await;
            assert!(!status.installed);
            assert!(!status.crd_found);
            assert!(status
                .message
                .starts_with("NVIDIA Dynamo CRD `dynamographdeployments.nvidia.com` could not be checked: "));
        }

        #[tokio::test]
        async fn operator_pending() {
            let mocks = Mocks {
                pods: Some(vec!["Pending", "Failed"]),
                ..Default::default()
            };
            let status = test(mocks).await;
            assert!(!status.installed);
            assert!(status.crd_found);
            assert!(!status.operator_running);
            assert_eq!(
                status.message,
                "NVIDIA Dynamo operator is not running in namespace `dynamo-system`"
            );
        }

        #[tokio::test]
        async fn operator_namespace_missing() {
            let mocks = Mocks {
                pods: None,
                ..Default::default()
            };
            let status = test(mocks).await;
            assert!(!status.operator_running);
        }
    }

    mod checksum {
        use super::*;

        #[test]
        fn stable_and_sensitive() {
            let a = checksum(&json!({"spec": {"replicas": 1}}));
            let b = checksum(&json!({"spec": {"replicas": 1}}));
            let c = checksum(&json!({"spec": {"replicas": 2}}));
            assert_eq!(a, b);
            assert_ne!(a, c);
            assert_eq!(a.len(), 64);
        }
    }

    mod helm_installation_steps {
        use super::*;

        #[test]
        fn repos_then_charts() {
            let repos = [HelmRepo {
                name: "kuberay",
                url: "https://ray-project.github.io/kuberay-helm/",
            }];
            let charts = [HelmChart {
                name: "kuberay-operator",
                chart: "kuberay/kuberay-operator",
                version: Some("1.4.2"),
                namespace: "kuberay-system",
                create_namespace: true,
                values: json!({"singleNamespaceInstall": false}),
            }];
            let steps = helm_installation_steps(&repos, &charts);
            assert_eq!(steps.len(), 2);
            assert_eq!(
                steps[0].command.as_deref(),
                Some("helm repo add kuberay https://ray-project.github.io/kuberay-helm/ && helm repo update")
            );
            assert_eq!(
                steps[1].command.as_deref(),
                Some("helm upgrade --install kuberay-operator kuberay/kuberay-operator -n kuberay-system --create-namespace --version 1.4.2 --set singleNamespaceInstall=false")
            );
        }
    }
}
