//! kiln-cluster: the slice of the cluster API Kiln depends on.
//!
//! Worker discovery and autoscaling only need a handful of verbs: watch
//! and list pods, JSON-patch a pod, read and replace a statefulset, read
//! and write a coordination lease, and resolve a tenant's namespace.
//! They are collected behind `ClusterApi` so the same logic runs against
//! a real cluster (`KubeCluster`) or the in-memory `FakeCluster`.
//!
//! # Architecture
//!
//! ```text
//! ClusterApi (trait)
//!   ├── KubeCluster  kube::Client, watcher streams, raw JSON patch
//!   └── FakeCluster  in-memory objects, resourceVersion conflicts
//!                      (feature "testing")
//! ```
//!
//! Cluster objects are only mutated through optimistic-concurrency
//! primitives. A stale write surfaces as `ClusterError::Conflict`, which
//! callers retry with `retry_on_conflict`.

pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod kube_cluster;
pub mod patch;
pub mod retry;
pub mod selector;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Pod;

pub use error::{ClusterError, ClusterResult};
#[cfg(any(test, feature = "testing"))]
pub use fake::FakeCluster;
pub use kube_cluster::KubeCluster;
pub use patch::{PatchOperation, escape_json_pointer};
pub use retry::retry_on_conflict;
pub use selector::LabelSelector;

/// A change observed on a watched pod.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

/// Stream of pod changes. Ends when the underlying watch closes.
pub type PodEventStream = BoxStream<'static, ClusterResult<PodEvent>>;

/// Cluster verbs used by discovery and autoscaling.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Watch pods matching `selector` in `namespace`.
    ///
    /// Pods that already exist are delivered first as `Added` events.
    async fn watch_pods(&self, namespace: &str, selector: &str) -> ClusterResult<PodEventStream>;

    /// List pods matching `selector` across every visible namespace.
    async fn list_pods(&self, selector: &str) -> ClusterResult<Vec<Pod>>;

    /// Apply an RFC 6902 JSON patch to a pod.
    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &[PatchOperation],
    ) -> ClusterResult<Pod>;

    async fn get_statefulset(&self, namespace: &str, name: &str) -> ClusterResult<StatefulSet>;

    /// Replace a statefulset; fails with `Conflict` on a stale resourceVersion.
    async fn replace_statefulset(
        &self,
        namespace: &str,
        statefulset: &StatefulSet,
    ) -> ClusterResult<StatefulSet>;

    /// Fetch a lease, `None` when it does not exist yet.
    async fn get_lease(&self, namespace: &str, name: &str) -> ClusterResult<Option<Lease>>;

    /// Create a lease; fails with `Conflict` when it already exists.
    async fn create_lease(&self, namespace: &str, lease: &Lease) -> ClusterResult<Lease>;

    /// Replace a lease; fails with `Conflict` on a stale resourceVersion.
    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> ClusterResult<Lease>;

    /// Namespace where the tsuru app `app` runs, read from its `App`
    /// resource at `spec.namespaceName`.
    async fn tenant_namespace(&self, app: &str) -> ClusterResult<String>;
}
