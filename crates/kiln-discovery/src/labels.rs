//! Tenant bookkeeping written onto a leased worker pod.
//!
//! While a build runs, the worker pod carries the tenant's app name, a
//! build marker, and the build-start time. The downscaler reads the
//! start/end annotations to decide whether a worker pool is idle.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kiln_cluster::{ClusterApi, ClusterResult, PatchOperation};
use kiln_core::TsuruApp;
use kiln_core::metadata::{
    LAST_BUILD_ENDING_ANNOTATION, LAST_BUILD_STARTING_ANNOTATION, TSURU_APP_NAME_LABEL,
    TSURU_APP_TEAM_LABEL, TSURU_IS_BUILD_LABEL,
};
use serde_json::Value;
use tracing::debug;

const LABELS: &str = "labels";
const ANNOTATIONS: &str = "annotations";

/// Patch tagging `pod` as building for `app`.
///
/// Missing label or annotation maps are created first, since a JSON
/// patch cannot add a member to an absent object.
pub fn set_labels_patch(pod: &Pod, app: &TsuruApp, now: DateTime<Utc>) -> Vec<PatchOperation> {
    let mut ops = Vec::with_capacity(7);
    if pod.metadata.labels.is_none() {
        ops.push(PatchOperation::Add {
            path: format!("/metadata/{LABELS}"),
            value: Value::Object(Default::default()),
        });
    }
    if pod.metadata.annotations.is_none() {
        ops.push(PatchOperation::Add {
            path: format!("/metadata/{ANNOTATIONS}"),
            value: Value::Object(Default::default()),
        });
    }

    ops.push(PatchOperation::add_metadata(LABELS, TSURU_APP_NAME_LABEL, &app.name));
    if !app.team.is_empty() {
        ops.push(PatchOperation::add_metadata(LABELS, TSURU_APP_TEAM_LABEL, &app.team));
    }
    ops.push(PatchOperation::add_metadata(LABELS, TSURU_IS_BUILD_LABEL, "true"));
    ops.push(PatchOperation::add_metadata(ANNOTATIONS, LAST_BUILD_ENDING_ANNOTATION, ""));
    ops.push(PatchOperation::add_metadata(
        ANNOTATIONS,
        LAST_BUILD_STARTING_ANNOTATION,
        now.timestamp().to_string(),
    ));
    ops
}

/// Inverse of `set_labels_patch`; also stamps the build-end time.
pub fn unset_labels_patch(team_set: bool, now: DateTime<Utc>) -> Vec<PatchOperation> {
    let mut ops = vec![PatchOperation::remove_metadata(LABELS, TSURU_APP_NAME_LABEL)];
    if team_set {
        ops.push(PatchOperation::remove_metadata(LABELS, TSURU_APP_TEAM_LABEL));
    }
    ops.push(PatchOperation::remove_metadata(LABELS, TSURU_IS_BUILD_LABEL));
    ops.push(PatchOperation::add_metadata(
        ANNOTATIONS,
        LAST_BUILD_ENDING_ANNOTATION,
        now.timestamp().to_string(),
    ));
    ops
}

/// Tag `pod` for `app`. Returns whether the team label was written, which
/// the matching unset needs to know.
pub async fn set_tenant_labels(
    cluster: &dyn ClusterApi,
    pod: &Pod,
    app: &TsuruApp,
) -> ClusterResult<bool> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let patch = set_labels_patch(pod, app, Utc::now());
    cluster.patch_pod(namespace, name, &patch).await?;
    debug!(%namespace, pod = %name, app = %app.name, "tagged worker pod");
    Ok(!app.team.is_empty())
}

pub async fn unset_tenant_labels(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    team_set: bool,
) -> ClusterResult<()> {
    let patch = unset_labels_patch(team_set, Utc::now());
    cluster.patch_pod(namespace, name, &patch).await?;
    debug!(%namespace, pod = %name, "untagged worker pod");
    Ok(())
}
