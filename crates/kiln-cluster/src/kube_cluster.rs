//! `ClusterApi` backed by a live Kubernetes API server.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::watcher;
use kube::Client;
use tracing::debug;

use kiln_core::metadata::TSURU_APP_NAMESPACE;

use crate::error::{ClusterError, ClusterResult};
use crate::patch::{PatchOperation, to_json_patch};
use crate::{ClusterApi, PodEvent, PodEventStream};

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster service account or the local
    /// kubeconfig, whichever is available.
    pub async fn try_default() -> ClusterResult<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn app_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("tsuru.io", "v1", "App"))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn watch_pods(&self, namespace: &str, selector: &str) -> ClusterResult<PodEventStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().labels(selector);
        debug!(%namespace, %selector, "starting pod watch");

        let stream = watcher(pods, config)
            .map_err(|e| ClusterError::Watch(e.to_string()))
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::InitApply(pod)) => Some(Ok(PodEvent::Added(pod))),
                    Ok(watcher::Event::Apply(pod)) => Some(Ok(PodEvent::Modified(pod))),
                    Ok(watcher::Event::Delete(pod)) => Some(Ok(PodEvent::Deleted(pod))),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(e)),
                }
            });
        Ok(stream.boxed())
    }

    async fn list_pods(&self, selector: &str) -> ClusterResult<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &[PatchOperation],
    ) -> ClusterResult<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = Patch::Json::<()>(to_json_patch(patch)?);
        pods.patch(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| match e {
                kube::Error::Api(resp) if resp.code == 422 => ClusterError::InvalidPatch {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    message: resp.message,
                },
                other => ClusterError::from_kube(other, "Pod", namespace, name),
            })
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> ClusterResult<StatefulSet> {
        let sts: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        sts.get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, "StatefulSet", namespace, name))
    }

    async fn replace_statefulset(
        &self,
        namespace: &str,
        statefulset: &StatefulSet,
    ) -> ClusterResult<StatefulSet> {
        let name = statefulset.metadata.name.clone().unwrap_or_default();
        let sts: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        sts.replace(&name, &PostParams::default(), statefulset)
            .await
            .map_err(|e| ClusterError::from_kube(e, "StatefulSet", namespace, &name))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> ClusterResult<Option<Lease>> {
        let leases: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        leases
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, "Lease", namespace, name))
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> ClusterResult<Lease> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        let leases: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        leases
            .create(&PostParams::default(), lease)
            .await
            .map_err(|e| ClusterError::from_kube(e, "Lease", namespace, &name))
    }

    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> ClusterResult<Lease> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        let leases: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        leases
            .replace(&name, &PostParams::default(), lease)
            .await
            .map_err(|e| ClusterError::from_kube(e, "Lease", namespace, &name))
    }

    async fn tenant_namespace(&self, app: &str) -> ClusterResult<String> {
        let ar = Self::app_resource();
        let apps: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), TSURU_APP_NAMESPACE, &ar);
        let obj = apps
            .get(app)
            .await
            .map_err(|e| ClusterError::from_kube(e, "App", TSURU_APP_NAMESPACE, app))?;

        obj.data
            .get("spec")
            .and_then(|spec| spec.get("namespaceName"))
            .and_then(|ns| ns.as_str())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ClusterError::MissingTenantNamespace(app.to_string()))
    }
}
