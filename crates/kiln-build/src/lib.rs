//! kiln-build: turn a build request into a pushed image and its tsuru config.
//!
//! # Architecture
//!
//! ```text
//! BuildService::build()            progress framing, response stream
//!   │
//!   └── BuildDispatcher::build()
//!         ├── validate_build_request()        (kiln-core)
//!         ├── containerfile + stage()         temp dir: Dockerfile,
//!         │                                   application.tar.gz, envs.sh
//!         ├── WorkerDiscoverer / static engine (kiln-discovery)
//!         ├── BuildEngine::solve()            export image
//!         └── extract                         Procfile, tsuru.yaml,
//!                                             image config
//! ```
//!
//! The tenant environment reaches the build only as a secret mount, so it
//! is never persisted in the produced image.

pub mod containerfile;
pub mod dispatcher;
pub mod error;
pub mod extract;
pub mod ports;
pub mod service;
pub mod staging;

#[cfg(test)]
mod test_support;

pub use dispatcher::{BuildDispatcher, DispatcherConfig};
pub use error::{BuildError, BuildResult};
pub use extract::AppFiles;
pub use ports::sort_exposed_ports;
pub use service::BuildService;
pub use staging::{StageSpec, StagedContext, stage};
