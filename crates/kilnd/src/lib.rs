//! kilnd: the Kiln build daemon.
//!
//! Assembles the build service, worker discovery, and the background
//! downscaler, and serves them over HTTP.
//!
//! ```text
//! kilnd --discovery --statefulset buildkit --namespace builders
//! ```

pub mod engine;
pub mod http;
pub mod settings;

pub use engine::UnlinkedEngine;
pub use http::{AppState, StreamMessage, build_router};
pub use settings::{Cli, DownscaleSettings, Settings};
