//! Periodic scale-to-zero of idle worker pools.
//!
//! Usage is read from the annotations discovery stamps onto worker pods
//! around every build. A namespace is evaluated in two passes: first
//! detect whether any of its pods is busy, then compute how long the
//! remaining pods have been idle. The result is independent of the order
//! in which the API server lists pods.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use kiln_cluster::{ClusterApi, retry_on_conflict};
use kiln_core::metadata::{
    LAST_BUILD_ENDING_ANNOTATION, LAST_BUILD_STARTING_ANNOTATION, LAST_REPLICAS_ANNOTATION,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ScaleError, ScaleResult};

/// How one worker pod is being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodUsage {
    /// A build holds the pod, or its bookkeeping is incomplete.
    Busy,
    /// Idle since this Unix timestamp.
    IdleSince(i64),
    /// The ending annotation could not be parsed; the pod is ignored.
    Unknown,
}

/// Aggregated usage of one worker namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceUsage {
    Busy,
    /// Idle since the most recent use of any of its pods.
    IdleSince(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleToZero,
    NoChange,
}

/// Outcome of one downscale pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Namespaces whose pool was scaled to zero.
    pub scaled: Vec<String>,
    /// Namespaces whose statefulset could not be read or written.
    pub failed: Vec<String>,
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Classify one worker pod.
///
/// A pod without either annotation was scheduled and never built, so its
/// creation time counts as the last use. A pod with both uses its ending
/// time. A start without an end is a build in progress, and an end
/// without a start is treated the same way since its state is unknown.
pub fn pod_usage(pod: &Pod) -> PodUsage {
    let start = annotation(pod, LAST_BUILD_STARTING_ANNOTATION);
    let end = annotation(pod, LAST_BUILD_ENDING_ANNOTATION);
    match (start, end) {
        (None, None) => match &pod.metadata.creation_timestamp {
            Some(created) => PodUsage::IdleSince(created.0.timestamp()),
            None => PodUsage::Busy,
        },
        (Some(_), Some(end)) => match end.trim().parse::<i64>() {
            Ok(ts) => PodUsage::IdleSince(ts),
            Err(e) => {
                error!(
                    pod = pod.metadata.name.as_deref().unwrap_or_default(),
                    value = %end,
                    error = %e,
                    "invalid last build ending annotation"
                );
                PodUsage::Unknown
            }
        },
        _ => PodUsage::Busy,
    }
}

/// Aggregate pod usage per namespace.
pub fn namespace_usage(pods: &[Pod]) -> BTreeMap<String, NamespaceUsage> {
    let classified: Vec<(&str, PodUsage)> = pods
        .iter()
        .filter_map(|p| Some((p.metadata.namespace.as_deref()?, pod_usage(p))))
        .collect();

    let mut usage = BTreeMap::new();
    for (ns, u) in &classified {
        if *u == PodUsage::Busy {
            usage.insert(ns.to_string(), NamespaceUsage::Busy);
        }
    }
    for (ns, u) in &classified {
        let PodUsage::IdleSince(ts) = *u else {
            continue;
        };
        let entry = usage
            .entry(ns.to_string())
            .or_insert(NamespaceUsage::IdleSince(ts));
        if let NamespaceUsage::IdleSince(max) = entry
            && ts > *max
        {
            *max = ts;
        }
    }
    usage
}

/// Decide whether a namespace with `usage` should be scaled to zero at `now`.
pub fn decide(usage: NamespaceUsage, now: i64, grace_period: Duration) -> ScaleDecision {
    match usage {
        NamespaceUsage::IdleSince(since) if now - since >= grace_period.as_secs() as i64 => {
            ScaleDecision::ScaleToZero
        }
        _ => ScaleDecision::NoChange,
    }
}

/// Background scale-to-zero loop over every worker namespace.
pub struct Downscaler {
    cluster: Arc<dyn ClusterApi>,
    pod_selector: String,
    statefulset: String,
    grace_period: Duration,
}

impl Downscaler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        pod_selector: impl Into<String>,
        statefulset: impl Into<String>,
        grace_period: Duration,
    ) -> Self {
        Self {
            cluster,
            pod_selector: pod_selector.into(),
            statefulset: statefulset.into(),
            grace_period,
        }
    }

    /// Run one pass. Failures on a single namespace are logged and
    /// reported, never fatal to the pass.
    pub async fn run_pass(&self) -> ScaleResult<PassReport> {
        let pods = self
            .cluster
            .list_pods(&self.pod_selector)
            .await
            .map_err(ScaleError::ListPods)?;
        let now = Utc::now().timestamp();

        let mut report = PassReport::default();
        for (ns, usage) in namespace_usage(&pods) {
            if decide(usage, now, self.grace_period) == ScaleDecision::NoChange {
                debug!(namespace = %ns, ?usage, "worker pool in use, keeping it");
                continue;
            }
            match self.scale_to_zero(&ns).await {
                Ok(Some(previous)) => {
                    info!(namespace = %ns, previous, "scaled idle worker pool to zero");
                    report.scaled.push(ns);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(namespace = %ns, error = %e, "failed to scale worker pool down");
                    report.failed.push(ns);
                }
            }
        }
        Ok(report)
    }

    /// Returns the previous replica count, or `None` when already at zero.
    async fn scale_to_zero(&self, namespace: &str) -> ScaleResult<Option<i32>> {
        let cluster = self.cluster.as_ref();
        let name = self.statefulset.as_str();
        retry_on_conflict(|| async move {
            let mut sts = cluster.get_statefulset(namespace, name).await?;
            let spec = sts.spec.get_or_insert_with(Default::default);
            let current = spec.replicas;
            if current == Some(0) {
                return Ok(None);
            }
            spec.replicas = Some(0);
            if let Some(n) = current {
                sts.metadata
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(LAST_REPLICAS_ANNOTATION.to_string(), n.to_string());
            }
            cluster.replace_statefulset(namespace, &sts).await?;
            Ok(Some(current.unwrap_or(1)))
        })
        .await
        .map_err(|source| ScaleError::StatefulSet {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        })
    }

    /// Like `run_pass`, but a panic inside the pass becomes an error.
    pub async fn run_pass_guarded(&self) -> ScaleResult<PassReport> {
        match AssertUnwindSafe(self.run_pass()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ScaleError::Panicked(message))
            }
        }
    }

    /// Run passes every `interval` until `shutdown` flips. The first pass
    /// runs immediately.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.grace_period.as_secs(),
            selector = %self.pod_selector,
            statefulset = %self.statefulset,
            "downscaler started"
        );

        loop {
            if let Err(e) = self.run_pass_guarded().await {
                warn!(error = %e, "downscale pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("downscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::coordination::v1::Lease;
    use kiln_cluster::fake::{set_annotation, set_created, test_pod, test_statefulset};
    use kiln_cluster::{ClusterResult, FakeCluster, PatchOperation, PodEventStream};

    const GRACE: Duration = Duration::from_secs(30 * 60);

    fn worker(ns: &str, name: &str) -> Pod {
        test_pod(ns, name, &[("app", "buildkit")])
    }

    fn ago(hours: i64) -> i64 {
        (Utc::now() - ChronoDuration::hours(hours)).timestamp()
    }

    fn built(ns: &str, name: &str, start: i64, end: i64) -> Pod {
        let mut pod = worker(ns, name);
        set_annotation(&mut pod, LAST_BUILD_STARTING_ANNOTATION, &start.to_string());
        set_annotation(&mut pod, LAST_BUILD_ENDING_ANNOTATION, &end.to_string());
        pod
    }

    fn building(ns: &str, name: &str) -> Pod {
        let mut pod = worker(ns, name);
        set_annotation(&mut pod, LAST_BUILD_STARTING_ANNOTATION, &ago(0).to_string());
        set_annotation(&mut pod, LAST_BUILD_ENDING_ANNOTATION, "");
        pod
    }

    fn replicas(cluster: &FakeCluster, ns: &str) -> Option<i32> {
        cluster
            .statefulset(ns, "buildkit")
            .and_then(|s| s.spec)
            .and_then(|s| s.replicas)
    }

    fn last_replicas(cluster: &FakeCluster, ns: &str) -> Option<String> {
        cluster
            .statefulset(ns, "buildkit")
            .and_then(|s| s.metadata.annotations)
            .and_then(|a| a.get(LAST_REPLICAS_ANNOTATION).cloned())
    }

    fn downscaler(cluster: Arc<FakeCluster>) -> Downscaler {
        Downscaler::new(cluster, "app=buildkit", "buildkit", GRACE)
    }

    // ── Classification ──────────────────────────────────────────────

    #[test]
    fn pod_usage_rules() {
        let mut fresh = worker("ns1", "p0");
        let created = Utc::now() - ChronoDuration::hours(5);
        set_created(&mut fresh, created);
        assert_eq!(pod_usage(&fresh), PodUsage::IdleSince(created.timestamp()));

        assert_eq!(pod_usage(&built("ns1", "p1", 10, 20)), PodUsage::IdleSince(20));
        assert_eq!(pod_usage(&building("ns1", "p2")), PodUsage::Busy);

        let mut end_only = worker("ns1", "p3");
        set_annotation(&mut end_only, LAST_BUILD_ENDING_ANNOTATION, "20");
        assert_eq!(pod_usage(&end_only), PodUsage::Busy);

        let mut garbage = worker("ns1", "p4");
        set_annotation(&mut garbage, LAST_BUILD_STARTING_ANNOTATION, "10");
        set_annotation(&mut garbage, LAST_BUILD_ENDING_ANNOTATION, "yesterday");
        assert_eq!(pod_usage(&garbage), PodUsage::Unknown);
    }

    #[test]
    fn busy_is_sticky_regardless_of_order() {
        let pods = vec![
            built("ns1", "p0", 1, 100),
            building("ns1", "p1"),
            built("ns1", "p2", 1, 200),
            built("ns2", "p0", 1, 50),
            built("ns2", "p1", 1, 70),
        ];
        let mut reversed = pods.clone();
        reversed.reverse();

        for input in [pods, reversed] {
            let usage = namespace_usage(&input);
            assert_eq!(usage["ns1"], NamespaceUsage::Busy);
            assert_eq!(usage["ns2"], NamespaceUsage::IdleSince(70));
        }
    }

    #[test]
    fn decision_respects_grace_period() {
        let now = 10_000;
        assert_eq!(
            decide(NamespaceUsage::IdleSince(now - 1800), now, GRACE),
            ScaleDecision::ScaleToZero
        );
        assert_eq!(
            decide(NamespaceUsage::IdleSince(now - 1799), now, GRACE),
            ScaleDecision::NoChange
        );
        assert_eq!(decide(NamespaceUsage::Busy, now, GRACE), ScaleDecision::NoChange);
    }

    // ── Passes ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn idle_pool_is_scaled_to_zero() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pod(built("ns1", "buildkit-0", ago(4), ago(3)));
        cluster.add_pod(built("ns1", "buildkit-1", ago(5), ago(4)));
        cluster.add_statefulset(test_statefulset("ns1", "buildkit", 2));

        let report = downscaler(cluster.clone()).run_pass().await.unwrap();
        assert_eq!(report.scaled, vec!["ns1".to_string()]);
        assert_eq!(replicas(&cluster, "ns1"), Some(0));
        assert_eq!(last_replicas(&cluster, "ns1").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn building_pod_keeps_pool_up() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pod(built("ns1", "buildkit-0", ago(4), ago(3)));
        cluster.add_pod(building("ns1", "buildkit-1"));
        cluster.add_statefulset(test_statefulset("ns1", "buildkit", 2));

        let report = downscaler(cluster.clone()).run_pass().await.unwrap();
        assert!(report.scaled.is_empty());
        assert_eq!(replicas(&cluster, "ns1"), Some(2));
        assert_eq!(cluster.statefulset_replaces(), 0);
    }

    #[tokio::test]
    async fn recent_build_keeps_pool_up() {
        let cluster = Arc::new(FakeCluster::new());
        let recent = (Utc::now() - ChronoDuration::minutes(10)).timestamp();
        cluster.add_pod(built("ns1", "buildkit-0", recent - 60, recent));
        cluster.add_statefulset(test_statefulset("ns1", "buildkit", 1));

        downscaler(cluster.clone()).run_pass().await.unwrap();
        assert_eq!(replicas(&cluster, "ns1"), Some(1));
    }

    #[tokio::test]
    async fn rescheduled_pod_uses_creation_time() {
        let cluster = Arc::new(FakeCluster::new());
        let mut pod = worker("ns1", "buildkit-0");
        set_created(&mut pod, Utc::now() - ChronoDuration::hours(3));
        cluster.add_pod(pod);
        cluster.add_statefulset(test_statefulset("ns1", "buildkit", 1));

        downscaler(cluster.clone()).run_pass().await.unwrap();
        assert_eq!(replicas(&cluster, "ns1"), Some(0));
    }

    #[tokio::test]
    async fn pool_already_at_zero_is_not_written() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pod(built("ns1", "buildkit-0", ago(4), ago(3)));
        cluster.add_statefulset(test_statefulset("ns1", "buildkit", 0));

        let report = downscaler(cluster.clone()).run_pass().await.unwrap();
        assert!(report.scaled.is_empty());
        assert_eq!(cluster.statefulset_replaces(), 0);
    }

    #[tokio::test]
    async fn one_failing_namespace_does_not_stop_the_pass() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pod(built("ns1", "buildkit-0", ago(4), ago(3)));
        cluster.add_pod(built("ns2", "buildkit-0", ago(4), ago(3)));
        // ns1 has no statefulset.
        cluster.add_statefulset(test_statefulset("ns2", "buildkit", 3));

        let report = downscaler(cluster.clone()).run_pass().await.unwrap();
        assert_eq!(report.failed, vec!["ns1".to_string()]);
        assert_eq!(report.scaled, vec!["ns2".to_string()]);
        assert_eq!(replicas(&cluster, "ns2"), Some(0));
    }

    #[tokio::test]
    async fn other_pods_are_ignored_by_selector() {
        let cluster = Arc::new(FakeCluster::new());
        let mut other = test_pod("ns1", "nginx-0", &[("app", "nginx")]);
        set_created(&mut other, Utc::now() - ChronoDuration::hours(10));
        cluster.add_pod(other);
        cluster.add_statefulset(test_statefulset("ns1", "buildkit", 1));

        let report = downscaler(cluster.clone()).run_pass().await.unwrap();
        assert!(report.scaled.is_empty());
        assert_eq!(replicas(&cluster, "ns1"), Some(1));
    }

    /// A worker picked by discovery is not protected until its labels and
    /// annotations land. A pass that lists pods before that still sees it
    /// as idle and scales the pool down; once stamped, the next pass
    /// leaves the pool alone.
    #[tokio::test]
    async fn downscale_races_unstamped_discovery() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pod(built("ns1", "buildkit-0", ago(4), ago(3)));
        cluster.add_statefulset(test_statefulset("ns1", "buildkit", 1));

        // Discovered but not yet stamped: the pass scales the pool away.
        let report = downscaler(cluster.clone()).run_pass().await.unwrap();
        assert_eq!(report.scaled, vec!["ns1".to_string()]);

        // Upscale back and stamp the pod as in use.
        let mut sts = cluster.statefulset("ns1", "buildkit").unwrap();
        sts.spec.as_mut().unwrap().replicas = Some(1);
        cluster.replace_statefulset("ns1", &sts).await.unwrap();
        cluster.update_pod(building("ns1", "buildkit-0"));

        let report = downscaler(cluster.clone()).run_pass().await.unwrap();
        assert!(report.scaled.is_empty());
        assert_eq!(replicas(&cluster, "ns1"), Some(1));
    }

    struct PanickingCluster;

    #[async_trait]
    impl ClusterApi for PanickingCluster {
        async fn watch_pods(&self, _: &str, _: &str) -> ClusterResult<PodEventStream> {
            unimplemented!()
        }
        async fn list_pods(&self, _: &str) -> ClusterResult<Vec<Pod>> {
            panic!("list exploded")
        }
        async fn patch_pod(&self, _: &str, _: &str, _: &[PatchOperation]) -> ClusterResult<Pod> {
            unimplemented!()
        }
        async fn get_statefulset(&self, _: &str, _: &str) -> ClusterResult<StatefulSet> {
            unimplemented!()
        }
        async fn replace_statefulset(&self, _: &str, _: &StatefulSet) -> ClusterResult<StatefulSet> {
            unimplemented!()
        }
        async fn get_lease(&self, _: &str, _: &str) -> ClusterResult<Option<Lease>> {
            unimplemented!()
        }
        async fn create_lease(&self, _: &str, _: &Lease) -> ClusterResult<Lease> {
            unimplemented!()
        }
        async fn replace_lease(&self, _: &str, _: &Lease) -> ClusterResult<Lease> {
            unimplemented!()
        }
        async fn tenant_namespace(&self, _: &str) -> ClusterResult<String> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn panic_in_pass_becomes_error() {
        let downscaler = Downscaler::new(Arc::new(PanickingCluster), "app=buildkit", "buildkit", GRACE);
        let err = downscaler.run_pass_guarded().await.unwrap_err();
        assert!(matches!(err, ScaleError::Panicked(ref m) if m == "list exploded"));
    }

    #[tokio::test]
    async fn loop_survives_panics_and_stops_on_shutdown() {
        let downscaler = Arc::new(Downscaler::new(
            Arc::new(PanickingCluster),
            "app=buildkit",
            "buildkit",
            GRACE,
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let downscaler = downscaler.clone();
            async move { downscaler.run(Duration::from_millis(10), rx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
