//! kiln-metrics: build observability for Kiln.
//!
//! Every series is labeled by the namespace of the worker pool serving
//! the build, so a shared deployment can tell tenants apart.
//!
//! # Architecture
//!
//! ```text
//! BuildMetrics
//!   ├── waiting_for_lease() → LeaseWait guard   (waiting gauge ±1)
//!   ├── build_started()     → ActiveBuild guard (active gauge ±1,
//!   │                                            total counter +1,
//!   │                                            duration on drop)
//!   └── snapshot()          → per-namespace values
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod build;
pub mod prometheus;

pub use build::{ActiveBuild, BuildMetrics, DURATION_BUCKETS, LeaseWait, NamespaceSnapshot};
pub use prometheus::render_prometheus;
