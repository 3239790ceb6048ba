//! kiln-discovery: find, lease, and connect to a build worker.
//!
//! A build that has no statically configured engine asks the
//! `WorkerDiscoverer` for one. Discovery watches the worker pods of the
//! pool, races for a coordination lease on every pod that becomes ready,
//! keeps the first lease it wins, and lets go of all the others.
//!
//! # Architecture
//!
//! ```text
//! WorkerDiscoverer::discover()
//!   │
//!   ├── upscale()                     (kiln-autoscale)
//!   │
//!   ├── PodNotifier ── ready pods ──▶ ExclusiveLeaser (actor)
//!   │                                   ├── LeaseAttempt  pod-0
//!   │                                   ├── LeaseAttempt  pod-1
//!   │                                   └── ...
//!   │                                        │ first won
//!   │◀───────────────────────────────────────┘
//!   │
//!   ├── set_tenant_labels()
//!   └── EngineConnector::connect()
//!
//! Release (LIFO): close engine → unset labels → cancel leader
//! ```
//!
//! Leases are held for as long as the build runs and are renewed in the
//! background. Cancelling the leader context releases the lease so the
//! worker is immediately available to the next build.

pub mod cleanup;
pub mod discoverer;
pub mod election;
pub mod error;
pub mod labels;
pub mod leaser;
pub mod notifier;

pub use cleanup::{CleanupStep, Release};
pub use discoverer::{DiscoveredWorker, DiscoveryOptions, WorkerDiscoverer};
pub use election::{LeaseTimings, holder_base};
pub use error::{DiscoveryError, DiscoveryResult};
pub use leaser::{ExclusiveLeaser, LeaserConfig, LeaserHandle, LeaserSnapshot};
pub use notifier::{PodNotifier, is_pod_ready};
