use std::future::Future;

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams, Patch,
        PatchParams, PostParams,
    },
    Api, Client, Result,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

// Consts

pub const MANAGER: &str = "llmdeck";

// CrdConfig

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdConfig {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl CrdConfig {
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(self.group, self.version, self.kind);
        ApiResource::from_gvk_with_plural(&gvk, self.plural)
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

// Traits

/// Primitives the core needs from the cluster.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait KubeClient: Send + Sync {
    fn apply_custom(
        &self,
        crd: &CrdConfig,
        ns: &str,
        name: &str,
        manifest: &Value,
    ) -> impl Future<Output = Result<Value>> + Send;

    fn create_custom(
        &self,
        crd: &CrdConfig,
        ns: &str,
        manifest: &Value,
    ) -> impl Future<Output = Result<Value>> + Send;

    fn delete_custom(
        &self,
        crd: &CrdConfig,
        ns: &str,
        name: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_custom(
        &self,
        crd: &CrdConfig,
        ns: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Value>>> + Send;

    fn list_custom(&self, crd: &CrdConfig, ns: &str)
        -> impl Future<Output = Result<Vec<Value>>> + Send;

    fn list_pods(&self, ns: &str, sel: &str) -> impl Future<Output = Result<Vec<Pod>>> + Send;

    fn pod_logs(
        &self,
        ns: &str,
        name: &str,
        container: Option<String>,
        tail: Option<i64>,
    ) -> impl Future<Output = Result<String>> + Send;
}

// DefaultKubeClient

pub struct DefaultKubeClient(Client);

impl DefaultKubeClient {
    pub fn new(kube: Client) -> Self {
        Self(kube)
    }

    fn custom_api(&self, crd: &CrdConfig, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.0.clone(), ns, &crd.api_resource())
    }
}

impl KubeClient for DefaultKubeClient {
    #[instrument(skip(self, crd, ns, name, manifest), fields(resource.api_version = %crd.api_version(), resource.kind = crd.kind, resource.name = name, resource.namespace = ns))]
    async fn apply_custom(
        &self,
        crd: &CrdConfig,
        ns: &str,
        name: &str,
        manifest: &Value,
    ) -> Result<Value> {
        debug!("applying resource");
        let api = self.custom_api(crd, ns);
        let params = PatchParams::apply(MANAGER).force();
        let obj = api.patch(name, &params, &Patch::Apply(manifest)).await?;
        to_value(&obj)
    }

    #[instrument(skip(self, crd, ns, manifest), fields(resource.api_version = %crd.api_version(), resource.kind = crd.kind, resource.namespace = ns))]
    async fn create_custom(&self, crd: &CrdConfig, ns: &str, manifest: &Value) -> Result<Value> {
        let obj: DynamicObject =
            serde_json::from_value(manifest.clone()).map_err(kube::Error::SerdeError)?;
        debug!("creating resource");
        let api = self.custom_api(crd, ns);
        let params = PostParams {
            field_manager: Some(MANAGER.into()),
            ..Default::default()
        };
        let obj = api.create(&params, &obj).await?;
        to_value(&obj)
    }

    #[instrument(skip(self, crd, ns, name), fields(resource.api_version = %crd.api_version(), resource.kind = crd.kind, resource.name = name, resource.namespace = ns))]
    async fn delete_custom(&self, crd: &CrdConfig, ns: &str, name: &str) -> Result<()> {
        debug!("deleting resource");
        let api = self.custom_api(crd, ns);
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    #[instrument(skip(self, crd, ns, name), fields(resource.api_version = %crd.api_version(), resource.kind = crd.kind, resource.name = name, resource.namespace = ns))]
    async fn get_custom(&self, crd: &CrdConfig, ns: &str, name: &str) -> Result<Option<Value>> {
        debug!("getting resource");
        let api = self.custom_api(crd, ns);
        api.get_opt(name)
            .await?
            .map(|obj| to_value(&obj))
            .transpose()
    }

    #[instrument(skip(self, crd, ns), fields(resource.api_version = %crd.api_version(), resource.kind = crd.kind, resource.namespace = ns))]
    async fn list_custom(&self, crd: &CrdConfig, ns: &str) -> Result<Vec<Value>> {
        debug!("listing resources");
        let api = self.custom_api(crd, ns);
        let list = api.list(&ListParams::default()).await?;
        list.items.iter().map(to_value).collect()
    }

    #[instrument(skip(self, ns, sel), fields(resource.namespace = ns, resource.selector = sel))]
    async fn list_pods(&self, ns: &str, sel: &str) -> Result<Vec<Pod>> {
        debug!("listing pods");
        let api: Api<Pod> = Api::namespaced(self.0.clone(), ns);
        let params = ListParams {
            label_selector: Some(sel.into()),
            ..Default::default()
        };
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    #[instrument(skip(self, ns, name, container, tail), fields(resource.name = name, resource.namespace = ns))]
    async fn pod_logs(
        &self,
        ns: &str,
        name: &str,
        container: Option<String>,
        tail: Option<i64>,
    ) -> Result<String> {
        debug!("reading pod logs");
        let api: Api<Pod> = Api::namespaced(self.0.clone(), ns);
        let params = LogParams {
            container,
            tail_lines: tail,
            ..Default::default()
        };
        api.logs(name, &params).await
    }
}

// Functions

pub fn selector(sel: &[(&str, &str)]) -> String {
    sel.iter()
        .map(|(key, val)| format!("{key}={val}"))
        .reduce(|acc, sel| format!("{acc},{sel}"))
        .unwrap_or_default()
}

fn to_value(obj: &DynamicObject) -> Result<Value> {
    serde_json::to_value(obj).map_err(kube::Error::SerdeError)
}

// Tests

#[cfg(test)]
mod test {
    use super::*;

    // Mods

    mod crd_config {
        use super::*;

        // Data

        const CRD: CrdConfig = CrdConfig {
            group: "nvidia.com",
            version: "v1alpha1",
            kind: "DynamoGraphDeployment",
            plural: "dynamographdeployments",
        };

        // Tests

        #[test]
        fn api_resource() {
            let res = CRD.api_resource();
            assert_eq!(res.api_version, "nvidia.com/v1alpha1");
            assert_eq!(res.kind, "DynamoGraphDeployment");
            assert_eq!(res.plural, "dynamographdeployments");
        }

        #[test]
        fn api_version() {
            assert_eq!(CRD.api_version(), "nvidia.com/v1alpha1");
        }
    }

    mod selector {
        use super::*;

        // Data

        #[derive(Clone, Default)]
        struct Data {
            selector: Vec<(&'static str, &'static str)>,
        }

        // Tests

        #[test]
        fn empty() {
            let data = Data::default();
            let sel = selector(&data.selector);
            assert!(sel.is_empty());
        }

        #[test]
        fn one() {
            let data = Data {
                selector: vec![("app.kubernetes.io/instance", "qwen")],
            };
            let sel = selector(&data.selector);
            assert_eq!(sel, "app.kubernetes.io/instance=qwen");
        }

        #[test]
        fn two() {
            let data = Data {
                selector: vec![
                    ("app.kubernetes.io/instance", "qwen"),
                    ("app.kubernetes.io/managed-by", "llmdeck"),
                ],
            };
            let sel = selector(&data.selector);
            assert_eq!(
                sel,
                "app.kubernetes.io/instance=qwen,app.kubernetes.io/managed-by=llmdeck"
            );
        }
    }
}
