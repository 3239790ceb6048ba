//! Prometheus text exposition format.

use crate::build::{BuildMetrics, DURATION_BUCKETS};

/// Render the build metrics into Prometheus text format.
///
/// HELP and TYPE lines are always present, even before the first build.
pub fn render_prometheus(metrics: &BuildMetrics) -> String {
    let snapshots = metrics.snapshot();
    let mut out = String::new();

    out.push_str("# HELP kiln_builds_waiting_for_lease Number of build requests currently waiting to acquire a lease on a worker pod.\n");
    out.push_str("# TYPE kiln_builds_waiting_for_lease gauge\n");
    for s in &snapshots {
        out.push_str(&format!(
            "kiln_builds_waiting_for_lease{{namespace=\"{}\"}} {}\n",
            s.namespace, s.waiting_for_lease
        ));
    }

    out.push_str("# HELP kiln_builds_active Number of builds currently running on a leased worker pod.\n");
    out.push_str("# TYPE kiln_builds_active gauge\n");
    for s in &snapshots {
        out.push_str(&format!(
            "kiln_builds_active{{namespace=\"{}\"}} {}\n",
            s.namespace, s.active
        ));
    }

    out.push_str("# HELP kiln_builds_total Total number of build requests received.\n");
    out.push_str("# TYPE kiln_builds_total counter\n");
    for s in &snapshots {
        for (kind, total) in &s.totals {
            out.push_str(&format!(
                "kiln_builds_total{{namespace=\"{}\",kind=\"{}\"}} {}\n",
                s.namespace, kind, total
            ));
        }
    }

    out.push_str("# HELP kiln_builds_duration_seconds Duration of builds in seconds.\n");
    out.push_str("# TYPE kiln_builds_duration_seconds histogram\n");
    for s in &snapshots {
        let cumulative = s.duration.cumulative();
        for (le, count) in DURATION_BUCKETS.iter().zip(cumulative) {
            out.push_str(&format!(
                "kiln_builds_duration_seconds_bucket{{namespace=\"{}\",le=\"{}\"}} {}\n",
                s.namespace, le, count
            ));
        }
        out.push_str(&format!(
            "kiln_builds_duration_seconds_bucket{{namespace=\"{}\",le=\"+Inf\"}} {}\n",
            s.namespace, s.duration.count
        ));
        out.push_str(&format!(
            "kiln_builds_duration_seconds_sum{{namespace=\"{}\"}} {}\n",
            s.namespace, s.duration.sum
        ));
        out.push_str(&format!(
            "kiln_builds_duration_seconds_count{{namespace=\"{}\"}} {}\n",
            s.namespace, s.duration.count
        ));
    }

    out
}
