//! kiln-autoscale: scale-from-zero and scale-to-zero for worker pools.
//!
//! Each worker namespace runs its workers as one statefulset. Two
//! independent paths touch its replica count:
//!
//! # Scaling Algorithm
//!
//! ```text
//! upscale (synchronous, before discovery):
//!     if replicas > 0: no-op
//!     replicas = annotation[last-replicas] or 1
//!
//! downscale pass (background, every interval):
//!     for each worker pod across namespaces:
//!         no start, no end  → idle since creation
//!         start and end     → idle since end
//!         anything else     → busy
//!     for each namespace with no busy pod:
//!         if now - max(idle since) >= grace:
//!             annotation[last-replicas] = replicas
//!             replicas = 0
//! ```
//!
//! Both paths write through resourceVersion-checked replaces and retry
//! on conflict, so a concurrent upscale and downscale cannot silently
//! overwrite each other.

pub mod downscaler;
pub mod error;
pub mod upscaler;

pub use downscaler::{Downscaler, NamespaceUsage, PassReport, PodUsage, ScaleDecision};
pub use error::{ScaleError, ScaleResult};
pub use upscaler::{UpscaleOutcome, upscale};
