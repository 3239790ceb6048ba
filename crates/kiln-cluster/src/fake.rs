//! In-memory `ClusterApi` for tests.
//!
//! Objects live in ordered maps keyed by `(namespace, name)`. Writes bump
//! a global resourceVersion and stale replaces fail with `Conflict`, so
//! optimistic-concurrency paths behave as they do against a real API
//! server. JSON patches are applied with the `json-patch` crate, so
//! `replace` and `remove` of a missing key fail as they would on the
//! server.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use tokio::sync::mpsc;

use crate::error::{ClusterError, ClusterResult};
use crate::patch::{PatchOperation, to_json_patch};
use crate::selector::LabelSelector;
use crate::{ClusterApi, PodEvent, PodEventStream};

type Key = (String, String);

struct Watcher {
    namespace: String,
    selector: LabelSelector,
    tx: mpsc::UnboundedSender<ClusterResult<PodEvent>>,
}

impl Watcher {
    fn wants(&self, pod: &Pod) -> bool {
        pod.metadata.namespace.as_deref() == Some(self.namespace.as_str())
            && self.selector.matches(&labels_of(pod))
    }
}

#[derive(Default)]
struct State {
    pods: BTreeMap<Key, Pod>,
    statefulsets: BTreeMap<Key, StatefulSet>,
    leases: BTreeMap<Key, Lease>,
    apps: BTreeMap<String, String>,
    watchers: Vec<Watcher>,
    resource_version: u64,
    statefulset_replaces: usize,
    pending_statefulset_conflicts: usize,
    fail_pod_patches: bool,
    patches: Vec<(String, String, Vec<PatchOperation>)>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn notify(&mut self, before: Option<&Pod>, after: &Pod) {
        self.watchers.retain(|w| {
            let was = before.is_some_and(|p| w.wants(p));
            let event = match (was, w.wants(after)) {
                (false, true) => PodEvent::Added(after.clone()),
                (true, true) => PodEvent::Modified(after.clone()),
                (true, false) => PodEvent::Deleted(after.clone()),
                (false, false) => return !w.tx.is_closed(),
            };
            w.tx.send(Ok(event)).is_ok()
        });
    }
}

/// In-memory cluster shared by the discovery, autoscaling, and build tests.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Seeding and inspection ──────────────────────────────────────

    /// Insert a pod, notifying watchers. Missing creation timestamps are
    /// filled with the current time.
    pub fn add_pod(&self, mut pod: Pod) {
        let mut state = self.lock();
        if pod.metadata.creation_timestamp.is_none() {
            pod.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        pod.metadata.resource_version = Some(state.next_version());
        let key = key_of(&pod.metadata);
        let before = state.pods.insert(key, pod.clone());
        state.notify(before.as_ref(), &pod);
    }

    /// Replace a stored pod with `pod` and notify watchers.
    pub fn update_pod(&self, pod: Pod) {
        self.add_pod(pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// End every open watch stream.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Number of watch streams still attached.
    pub fn open_watches(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    pub fn add_statefulset(&self, mut sts: StatefulSet) {
        let mut state = self.lock();
        sts.metadata.resource_version = Some(state.next_version());
        let key = key_of(&sts.metadata);
        state.statefulsets.insert(key, sts);
    }

    pub fn statefulset(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
        self.lock()
            .statefulsets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Successful statefulset replaces so far.
    pub fn statefulset_replaces(&self) -> usize {
        self.lock().statefulset_replaces
    }

    /// Make the next `n` statefulset replaces fail with `Conflict`.
    pub fn inject_statefulset_conflicts(&self, n: usize) {
        self.lock().pending_statefulset_conflicts = n;
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.lock()
            .leases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn leases(&self) -> Vec<Lease> {
        self.lock().leases.values().cloned().collect()
    }

    /// Register a tsuru `App` resource living in `namespace`.
    pub fn set_app_namespace(&self, app: &str, namespace: &str) {
        self.lock()
            .apps
            .insert(app.to_string(), namespace.to_string());
    }

    /// Make every pod patch fail.
    pub fn fail_pod_patches(&self, fail: bool) {
        self.lock().fail_pod_patches = fail;
    }

    /// Patches applied so far, as `(namespace, pod, ops)`.
    pub fn pod_patches(&self) -> Vec<(String, String, Vec<PatchOperation>)> {
        self.lock().patches.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn watch_pods(&self, namespace: &str, selector: &str) -> ClusterResult<PodEventStream> {
        let selector = LabelSelector::parse(selector).map_err(ClusterError::Watch)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            namespace: namespace.to_string(),
            selector,
            tx,
        };

        let mut state = self.lock();
        for pod in state.pods.values().filter(|p| watcher.wants(p)) {
            let _ = watcher.tx.send(Ok(PodEvent::Added(pod.clone())));
        }
        state.watchers.push(watcher);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }

    async fn list_pods(&self, selector: &str) -> ClusterResult<Vec<Pod>> {
        let selector = LabelSelector::parse(selector).map_err(ClusterError::Request)?;
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| selector.matches(&labels_of(p)))
            .cloned()
            .collect())
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &[PatchOperation],
    ) -> ClusterResult<Pod> {
        let mut state = self.lock();
        let invalid = |message: String| ClusterError::InvalidPatch {
            namespace: namespace.to_string(),
            name: name.to_string(),
            message,
        };
        if state.fail_pod_patches {
            return Err(invalid("patch rejected".to_string()));
        }

        let key = (namespace.to_string(), name.to_string());
        let before = state
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        let ops = to_json_patch(patch).map_err(|e| invalid(e.to_string()))?;
        let mut doc = serde_json::to_value(&before)?;
        json_patch::patch(&mut doc, &ops).map_err(|e| invalid(e.to_string()))?;
        let mut after: Pod = serde_json::from_value(doc)?;
        after.metadata.resource_version = Some(state.next_version());

        state.pods.insert(key, after.clone());
        state
            .patches
            .push((namespace.to_string(), name.to_string(), patch.to_vec()));
        state.notify(Some(&before), &after);
        Ok(after)
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> ClusterResult<StatefulSet> {
        self.statefulset(namespace, name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "StatefulSet",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn replace_statefulset(
        &self,
        namespace: &str,
        statefulset: &StatefulSet,
    ) -> ClusterResult<StatefulSet> {
        let mut state = self.lock();
        let name = statefulset.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        let conflict = ClusterError::Conflict {
            kind: "StatefulSet",
            namespace: namespace.to_string(),
            name: name.clone(),
        };

        if state.pending_statefulset_conflicts > 0 {
            state.pending_statefulset_conflicts -= 1;
            // Someone else wrote in between.
            if let Some(current) = state.statefulsets.get(&key).cloned() {
                let mut bumped = current;
                bumped.metadata.resource_version = Some(state.next_version());
                state.statefulsets.insert(key, bumped);
            }
            return Err(conflict);
        }

        let current = state
            .statefulsets
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "StatefulSet",
                namespace: namespace.to_string(),
                name: name.clone(),
            })?;
        if current.metadata.resource_version != statefulset.metadata.resource_version {
            return Err(conflict);
        }

        let mut stored = statefulset.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.statefulsets.insert(key, stored.clone());
        state.statefulset_replaces += 1;
        Ok(stored)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> ClusterResult<Option<Lease>> {
        Ok(self.lease(namespace, name))
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> ClusterResult<Lease> {
        let mut state = self.lock();
        let name = lease.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        if state.leases.contains_key(&key) {
            return Err(ClusterError::Conflict {
                kind: "Lease",
                namespace: namespace.to_string(),
                name,
            });
        }
        let mut stored = lease.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(state.next_version());
        state.leases.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> ClusterResult<Lease> {
        let mut state = self.lock();
        let name = lease.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        let current = state.leases.get(&key).ok_or_else(|| ClusterError::NotFound {
            kind: "Lease",
            namespace: namespace.to_string(),
            name: name.clone(),
        })?;
        if current.metadata.resource_version != lease.metadata.resource_version {
            return Err(ClusterError::Conflict {
                kind: "Lease",
                namespace: namespace.to_string(),
                name,
            });
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.leases.insert(key, stored.clone());
        Ok(stored)
    }

    async fn tenant_namespace(&self, app: &str) -> ClusterResult<String> {
        match self.lock().apps.get(app) {
            Some(ns) if !ns.is_empty() => Ok(ns.clone()),
            Some(_) => Err(ClusterError::MissingTenantNamespace(app.to_string())),
            None => Err(ClusterError::NotFound {
                kind: "App",
                namespace: kiln_core::metadata::TSURU_APP_NAMESPACE.to_string(),
                name: app.to_string(),
            }),
        }
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn key_of(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn labels_of(pod: &Pod) -> BTreeMap<String, String> {
    pod.metadata.labels.clone().unwrap_or_default()
}

/// A pending pod with `labels` and no IP.
pub fn test_pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Mark `pod` running, addressable at `ip`, and ready.
pub fn mark_ready(pod: &mut Pod, ip: &str) {
    let status = pod.status.get_or_insert_with(Default::default);
    status.phase = Some("Running".to_string());
    status.pod_ip = Some(ip.to_string());
    status.conditions = Some(vec![PodCondition {
        type_: "Ready".to_string(),
        status: "True".to_string(),
        ..Default::default()
    }]);
}

/// A running, ready pod at `ip`.
pub fn ready_pod(namespace: &str, name: &str, ip: &str, labels: &[(&str, &str)]) -> Pod {
    let mut pod = test_pod(namespace, name, labels);
    mark_ready(&mut pod, ip);
    pod
}

pub fn set_created(pod: &mut Pod, at: DateTime<Utc>) {
    pod.metadata.creation_timestamp = Some(Time(at));
}

pub fn set_annotation(pod: &mut Pod, key: &str, value: &str) {
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

pub fn test_statefulset(namespace: &str, name: &str, replicas: i32) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}
