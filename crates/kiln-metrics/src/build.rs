//! Build metrics registry.
//!
//! A single mutex guards the per-namespace table. Updates happen a few
//! times per build, never on a hot path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

/// Upper bounds of the duration histogram, in seconds (10s × 2^n).
pub const DURATION_BUCKETS: [f64; 10] = [
    10.0, 20.0, 40.0, 80.0, 160.0, 320.0, 640.0, 1280.0, 2560.0, 5120.0,
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    /// Non-cumulative counts per bucket in `DURATION_BUCKETS`.
    pub buckets: [u64; DURATION_BUCKETS.len()],
    pub sum: f64,
    pub count: u64,
}

impl Histogram {
    fn observe(&mut self, seconds: f64) {
        if let Some(i) = DURATION_BUCKETS.iter().position(|le| seconds <= *le) {
            self.buckets[i] += 1;
        }
        self.sum += seconds;
        self.count += 1;
    }

    /// Cumulative counts, one per bucket, as Prometheus expects.
    pub fn cumulative(&self) -> [u64; DURATION_BUCKETS.len()] {
        let mut out = self.buckets;
        for i in 1..out.len() {
            out[i] += out[i - 1];
        }
        out
    }
}

/// Point-in-time values for one worker namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceSnapshot {
    pub namespace: String,
    pub waiting_for_lease: i64,
    pub active: i64,
    /// Total builds by kind.
    pub totals: BTreeMap<String, u64>,
    pub duration: Histogram,
}

#[derive(Default)]
struct NamespaceMetrics {
    waiting_for_lease: i64,
    active: i64,
    totals: BTreeMap<String, u64>,
    duration: Histogram,
}

#[derive(Default)]
pub struct BuildMetrics {
    namespaces: Mutex<BTreeMap<String, NamespaceMetrics>>,
}

impl BuildMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, NamespaceMetrics>> {
        self.namespaces.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with<R>(&self, namespace: &str, f: impl FnOnce(&mut NamespaceMetrics) -> R) -> R {
        let mut table = self.lock();
        f(table.entry(namespace.to_string()).or_default())
    }

    /// Count a build as waiting for a worker lease until the guard drops.
    pub fn waiting_for_lease(self: &Arc<Self>, namespace: &str) -> LeaseWait {
        self.with(namespace, |m| m.waiting_for_lease += 1);
        LeaseWait {
            metrics: Arc::clone(self),
            namespace: namespace.to_string(),
        }
    }

    /// Record the start of a build of `kind` on a worker in `namespace`.
    ///
    /// The returned guard keeps the build in the active gauge and records
    /// its duration when dropped.
    pub fn build_started(self: &Arc<Self>, namespace: &str, kind: &str) -> ActiveBuild {
        self.with(namespace, |m| {
            m.active += 1;
            *m.totals.entry(kind.to_string()).or_default() += 1;
        });
        debug!(%namespace, %kind, "build started");
        ActiveBuild {
            metrics: Arc::clone(self),
            namespace: namespace.to_string(),
            started: Instant::now(),
        }
    }

    fn build_finished(&self, namespace: &str, elapsed: Duration) {
        self.with(namespace, |m| {
            m.active -= 1;
            m.duration.observe(elapsed.as_secs_f64());
        });
    }

    pub fn snapshot(&self) -> Vec<NamespaceSnapshot> {
        self.lock()
            .iter()
            .map(|(ns, m)| NamespaceSnapshot {
                namespace: ns.clone(),
                waiting_for_lease: m.waiting_for_lease,
                active: m.active,
                totals: m.totals.clone(),
                duration: m.duration.clone(),
            })
            .collect()
    }

    pub fn waiting(&self, namespace: &str) -> i64 {
        self.lock()
            .get(namespace)
            .map_or(0, |m| m.waiting_for_lease)
    }

    pub fn active(&self, namespace: &str) -> i64 {
        self.lock().get(namespace).map_or(0, |m| m.active)
    }

    pub fn total(&self, namespace: &str, kind: &str) -> u64 {
        self.lock()
            .get(namespace)
            .and_then(|m| m.totals.get(kind).copied())
            .unwrap_or(0)
    }
}

/// Guard for the waiting-for-lease gauge.
pub struct LeaseWait {
    metrics: Arc<BuildMetrics>,
    namespace: String,
}

impl Drop for LeaseWait {
    fn drop(&mut self) {
        self.metrics
            .with(&self.namespace, |m| m.waiting_for_lease -= 1);
    }
}

/// Guard for a running build.
pub struct ActiveBuild {
    metrics: Arc<BuildMetrics>,
    namespace: String,
    started: Instant,
}

impl ActiveBuild {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Drop for ActiveBuild {
    fn drop(&mut self) {
        self.metrics
            .build_finished(&self.namespace, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_gauge_follows_guard() {
        let metrics = BuildMetrics::new();
        let a = metrics.waiting_for_lease("ns1");
        let b = metrics.waiting_for_lease("ns1");
        assert_eq!(metrics.waiting("ns1"), 2);
        drop(a);
        assert_eq!(metrics.waiting("ns1"), 1);
        drop(b);
        assert_eq!(metrics.waiting("ns1"), 0);
        assert_eq!(metrics.waiting("unknown"), 0);
    }

    #[test]
    fn active_build_records_total_and_duration() {
        let metrics = BuildMetrics::new();
        {
            let build = metrics.build_started("ns1", "app_build_with_source_upload");
            assert_eq!(build.namespace(), "ns1");
            assert_eq!(metrics.active("ns1"), 1);
        }
        assert_eq!(metrics.active("ns1"), 0);
        assert_eq!(metrics.total("ns1", "app_build_with_source_upload"), 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].duration.count, 1);
        // A build that finished instantly falls in the first bucket.
        assert_eq!(snap[0].duration.buckets[0], 1);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let mut h = Histogram::default();
        h.observe(5.0);
        h.observe(15.0);
        h.observe(15.0);
        h.observe(10_000.0);
        let cumulative = h.cumulative();
        assert_eq!(cumulative[0], 1);
        assert_eq!(cumulative[1], 3);
        assert_eq!(cumulative[9], 3);
        assert_eq!(h.count, 4);
        assert_eq!(h.sum, 10_035.0);
    }
}
