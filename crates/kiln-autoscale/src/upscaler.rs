//! Scale a worker pool up from zero before waiting for its pods.

use kiln_cluster::{ClusterApi, retry_on_conflict};
use kiln_core::OutputWriter;
use kiln_core::metadata::LAST_REPLICAS_ANNOTATION;
use k8s_openapi::api::apps::v1::StatefulSet;
use tracing::{debug, info, warn};

use crate::error::{ScaleError, ScaleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleOutcome {
    /// The pool already had this many replicas; nothing was written.
    AlreadyRunning(i32),
    /// The pool was at zero and now asks for this many replicas.
    ScaledTo(i32),
}

/// Make sure the `statefulset` in `namespace` has at least one replica.
///
/// A pool at zero is restored to the count remembered in the
/// last-replicas annotation, or to one replica when the annotation is
/// missing or unusable. The caller is told about the scale-up through
/// `out`.
pub async fn upscale(
    cluster: &dyn ClusterApi,
    namespace: &str,
    statefulset: &str,
    out: &OutputWriter,
) -> ScaleResult<UpscaleOutcome> {
    let outcome = retry_on_conflict(|| async move {
        let mut sts = cluster.get_statefulset(namespace, statefulset).await?;
        let current = replicas(&sts);
        if current > 0 {
            return Ok(UpscaleOutcome::AlreadyRunning(current));
        }

        let wanted = remembered_replicas(&sts, namespace, statefulset);
        sts.spec.get_or_insert_with(Default::default).replicas = Some(wanted);
        cluster.replace_statefulset(namespace, &sts).await?;
        Ok(UpscaleOutcome::ScaledTo(wanted))
    })
    .await
    .map_err(|source| ScaleError::StatefulSet {
        namespace: namespace.to_string(),
        name: statefulset.to_string(),
        source,
    })?;

    match outcome {
        UpscaleOutcome::AlreadyRunning(n) => {
            debug!(%namespace, %statefulset, replicas = n, "worker pool already running");
        }
        UpscaleOutcome::ScaledTo(n) => {
            info!(%namespace, %statefulset, replicas = n, "scaled worker pool up from zero");
            out.line(format!(
                "There is no workers available, scaling to {n} replica(s)"
            ));
        }
    }
    Ok(outcome)
}

fn replicas(sts: &StatefulSet) -> i32 {
    sts.spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0)
}

fn remembered_replicas(sts: &StatefulSet, namespace: &str, name: &str) -> i32 {
    let Some(raw) = sts
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_REPLICAS_ANNOTATION))
        .filter(|v| !v.is_empty())
    else {
        return 1;
    };
    match raw.trim().parse::<i32>() {
        Ok(n) if n > 0 => n,
        _ => {
            warn!(%namespace, statefulset = %name, value = %raw, "ignoring invalid last-replicas annotation");
            1
        }
    }
}
