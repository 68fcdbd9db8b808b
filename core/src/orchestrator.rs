use std::{cmp::Ordering, sync::Arc};

use enum_display::EnumDisplay;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::{
    clock::Clock,
    err::{is_not_found, Error, Result},
    kube::{selector, CrdConfig, KubeClient},
    provider::{check_installation, InstallationStatus, Provider},
    registry::ProviderRegistry,
    status::{DeploymentStatus, PodInfo},
    ANNOT_CHECKSUM, LABEL_INSTANCE,
};

// ApplyOutcome

#[derive(Clone, Copy, Debug, EnumDisplay, Eq, PartialEq, Serialize)]
pub enum ApplyOutcome {
    Created,
    Unchanged,
    Updated,
}

// Pagination

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: Option<usize>,
}

// DeploymentPage

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPage {
    pub deployments: Vec<DeploymentStatus>,
    pub total: usize,
    pub has_more: bool,
}

// ProviderInfo

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub default_namespace: &'static str,
    pub crd: CrdConfig,
    pub installation: InstallationStatus,
}

// DeploymentOrchestrator

pub struct DeploymentOrchestrator<CLOCK: Clock, KUBE: KubeClient> {
    clock: Arc<CLOCK>,
    kube: Arc<KUBE>,
    registry: ProviderRegistry,
}

impl<CLOCK: Clock, KUBE: KubeClient> DeploymentOrchestrator<CLOCK, KUBE> {
    pub fn new(registry: ProviderRegistry, kube: Arc<KUBE>, clock: Arc<CLOCK>) -> Self {
        Self {
            clock,
            kube,
            registry,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Creates the deployment if absent, leaves it alone if its checksum matches, updates it otherwise.
    #[instrument(skip(self, raw), fields(provider.id = provider_id))]
    pub async fn apply_deployment(
        &self,
        raw: &Value,
        provider_id: &str,
    ) -> Result<(ApplyOutcome, DeploymentStatus)> {
        let provider = self.registry.get(provider_id)?;
        let cfg = provider.validate_config(raw).map_err(Error::Validation)?;
        let manifest = provider.generate_manifest(&cfg);
        let crd = provider.crd();
        let existing = self.kube.get_custom(&crd, &cfg.namespace, &cfg.name).await?;
        let (outcome, obj) = match existing {
            None => {
                let obj = self.kube.create_custom(&crd, &cfg.namespace, &manifest).await?;
                (ApplyOutcome::Created, obj)
            }
            Some(obj) if annotation(&obj, ANNOT_CHECKSUM).is_some()
                && annotation(&obj, ANNOT_CHECKSUM) == annotation(&manifest, ANNOT_CHECKSUM) =>
            {
                (ApplyOutcome::Unchanged, obj)
            }
            Some(_) => {
                let obj = self
                    .kube
                    .apply_custom(&crd, &cfg.namespace, &cfg.name, &manifest)
                    .await?;
                (ApplyOutcome::Updated, obj)
            }
        };
        info!(
            deployment.name = %cfg.name,
            deployment.namespace = %cfg.namespace,
            "deployment {}",
            outcome.to_string().to_lowercase()
        );
        Ok((outcome, self.status_of(provider.as_ref(), &obj)))
    }

    #[instrument(skip(self, raw), fields(provider.id = provider_id))]
    pub async fn create_deployment(&self, raw: &Value, provider_id: &str) -> Result<DeploymentStatus> {
        let provider = self.registry.get(provider_id)?;
        let cfg = provider.validate_config(raw).map_err(Error::Validation)?;
        let manifest = provider.generate_manifest(&cfg);
        let obj = self
            .kube
            .create_custom(&provider.crd(), &cfg.namespace, &manifest)
            .await?;
        info!(
            deployment.name = %cfg.name,
            deployment.namespace = %cfg.namespace,
            "deployment created"
        );
        Ok(self.status_of(provider.as_ref(), &obj))
    }

    /// Deletes the deployment from the custom resource type of the provider that owns it.
    #[instrument(skip(self, name, ns), fields(deployment.name = name, deployment.namespace = ns))]
    pub async fn delete_deployment(&self, name: &str, ns: &str) -> Result {
        let (provider, _) = self.find(name, ns).await?.ok_or_else(|| not_found(name, ns))?;
        self.kube.delete_custom(&provider.crd(), ns, name).await?;
        info!(provider.id = provider.id(), "deployment deleted");
        Ok(())
    }

    #[instrument(skip(self, name, ns), fields(deployment.name = name, deployment.namespace = ns))]
    pub async fn get_deployment(&self, name: &str, ns: &str) -> Result<DeploymentStatus> {
        let (provider, obj) = self.find(name, ns).await?.ok_or_else(|| not_found(name, ns))?;
        let mut status = self.status_of(provider.as_ref(), &obj);
        let sel = selector(&[(LABEL_INSTANCE, name)]);
        let pods = self.kube.list_pods(ns, &sel).await?;
        status.pods = pods.into_iter().map(PodInfo::from).collect();
        Ok(status)
    }

    pub async fn installation_status(&self, provider_id: &str) -> Result<InstallationStatus> {
        let provider = self.registry.get(provider_id)?;
        Ok(check_installation(provider.as_ref(), self.kube.as_ref()).await)
    }

    #[instrument(skip(self, ns, page), fields(deployment.namespace = ns, page.offset = page.offset, page.limit = ?page.limit))]
    pub async fn list(&self, ns: Option<&str>, page: Pagination) -> Result<DeploymentPage> {
        let deployments = match ns {
            Some(ns) => self.list_deployments(ns).await?,
            None => self.list_all_deployments().await,
        };
        Ok(paginate(deployments, page))
    }

    #[instrument(skip(self, ns), fields(deployment.namespace = ns))]
    pub async fn list_deployments(&self, ns: &str) -> Result<Vec<DeploymentStatus>> {
        let mut deployments = vec![];
        for provider in self.registry.providers() {
            match self.kube.list_custom(&provider.crd(), ns).await {
                Ok(objs) => {
                    deployments.extend(objs.iter().map(|obj| self.status_of(provider.as_ref(), obj)))
                }
                Err(err) if is_not_found(&err) => {
                    debug!(provider.id = provider.id(), "custom resource type not found");
                }
                Err(err) => return Err(err.into()),
            }
        }
        sort_deployments(&mut deployments);
        Ok(deployments)
    }

    pub async fn pod_logs(
        &self,
        ns: &str,
        pod: &str,
        container: Option<String>,
        tail: Option<i64>,
    ) -> Result<String> {
        let logs = self.kube.pod_logs(ns, pod, container, tail).await?;
        Ok(logs)
    }

    #[instrument(skip(self))]
    pub async fn providers(&self) -> Vec<ProviderInfo> {
        let providers = self.registry.providers();
        let statuses = join_all(
            providers
                .iter()
                .map(|provider| check_installation(provider.as_ref(), self.kube.as_ref())),
        )
        .await;
        providers
            .iter()
            .zip(statuses)
            .map(|(provider, installation)| ProviderInfo {
                id: provider.id(),
                name: provider.name(),
                description: provider.description(),
                default_namespace: provider.default_namespace(),
                crd: provider.crd(),
                installation,
            })
            .collect()
    }

    fn default_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces: Vec<&'static str> = vec![];
        for provider in self.registry.providers() {
            let ns = provider.default_namespace();
            if !namespaces.contains(&ns) {
                namespaces.push(ns);
            }
        }
        namespaces
    }

    async fn find(&self, name: &str, ns: &str) -> Result<Option<(Arc<dyn Provider>, Value)>> {
        for provider in self.registry.providers() {
            match self.kube.get_custom(&provider.crd(), ns, name).await {
                Ok(Some(obj)) => return Ok(Some((provider.clone(), obj))),
                Ok(None) => {}
                Err(err) if is_not_found(&err) => {
                    debug!(provider.id = provider.id(), "custom resource type not found");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    async fn list_all_deployments(&self) -> Vec<DeploymentStatus> {
        let namespaces = self.default_namespaces();
        let lists = join_all(namespaces.iter().map(|ns| self.list_deployments(ns))).await;
        let mut deployments: Vec<DeploymentStatus> = namespaces
            .iter()
            .zip(lists)
            .flat_map(|(ns, res)| match res {
                Ok(deployments) => deployments,
                Err(err) => {
                    warn!(deployment.namespace = ns, "failed to list deployments: {err}");
                    vec![]
                }
            })
            .collect();
        sort_deployments(&mut deployments);
        deployments
    }

    fn status_of(&self, provider: &dyn Provider, obj: &Value) -> DeploymentStatus {
        let mut status = provider.parse_status(obj, self.clock.now());
        status.provider = provider.id().into();
        status
    }
}

// Functions

/// Slices a sorted list. `has_more` tells whether deployments remain after the page.
pub fn paginate(deployments: Vec<DeploymentStatus>, page: Pagination) -> DeploymentPage {
    let total = deployments.len();
    let deployments: Vec<DeploymentStatus> = deployments
        .into_iter()
        .skip(page.offset)
        .take(page.limit.unwrap_or(usize::MAX))
        .collect();
    DeploymentPage {
        has_more: page.offset.saturating_add(deployments.len()) < total,
        deployments,
        total,
    }
}

/// Newest first, ties by name.
pub fn sort_deployments(deployments: &mut [DeploymentStatus]) {
    deployments.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        Ordering::Equal => a.name.cmp(&b.name),
        ord => ord,
    });
}

fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.pointer("/metadata/annotations")
        .and_then(|annots| annots.get(key))
        .and_then(Value::as_str)
}

fn not_found(name: &str, ns: &str) -> Error {
    Error::DeploymentNotFound {
        name: name.into(),
        namespace: ns.into(),
    }
}

// Tests
