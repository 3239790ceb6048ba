//! Remote build engine interfaces.
//!
//! Image-layer construction, Dockerfile semantics, and the registry push
//! protocol all live behind these traits. A worker is reached at
//! `tcp://<ip>:<port>`; connectors must fail fast instead of waiting for
//! the endpoint to come up.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Code;
use crate::output::OutputWriter;
use crate::types::ImageConfig;

/// Frontend that interprets the staged `Dockerfile`.
pub const DOCKERFILE_FRONTEND: &str = "dockerfile.v0";

/// Errors reported by the remote build engine, passed through verbatim.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to build engine at {address}: {message}")]
    Connect { address: String, message: String },

    #[error("{0}")]
    Solve(String),

    #[error("failed to prune build cache: {0}")]
    Prune(String),

    #[error("failed to inspect image {image}: {message}")]
    Inspect { image: String, message: String },

    #[error("build engine call cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn code(&self) -> Code {
        match self {
            EngineError::Connect { .. } => Code::Unavailable,
            EngineError::Cancelled => Code::Cancelled,
            _ => Code::Unknown,
        }
    }
}

/// How the solved build is exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Export {
    /// Tag (and optionally push) the image under every name.
    Image {
        names: Vec<String>,
        push: bool,
        insecure_registry: bool,
    },
    /// Return the resulting root filesystem as an uncompressed tarball.
    Tar,
}

impl Export {
    /// Exporter attributes as understood by the engine.
    pub fn attrs(&self) -> BTreeMap<String, String> {
        match self {
            Export::Image {
                names,
                push,
                insecure_registry,
            } => BTreeMap::from([
                ("name".to_string(), names.join(",")),
                ("push".to_string(), push.to_string()),
                ("registry.insecure".to_string(), insecure_registry.to_string()),
            ]),
            Export::Tar => BTreeMap::new(),
        }
    }
}

/// A file exposed to the build as a secret mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSource {
    pub id: String,
    pub path: PathBuf,
}

/// Parameters for one solve call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveOptions {
    pub frontend: String,
    pub frontend_attrs: BTreeMap<String, String>,
    /// Directory holding both the build context and the `Dockerfile`.
    pub context_dir: PathBuf,
    pub export: Export,
    pub secrets: Vec<SecretSource>,
}

impl SolveOptions {
    pub fn dockerfile(context_dir: impl Into<PathBuf>, export: Export) -> Self {
        Self {
            frontend: DOCKERFILE_FRONTEND.to_string(),
            frontend_attrs: BTreeMap::new(),
            context_dir: context_dir.into(),
            export,
            secrets: Vec::new(),
        }
    }
}

/// Result of a solve call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveResponse {
    /// Present when the export was `Export::Tar`.
    pub tarball: Option<Vec<u8>>,
    pub exporter_response: BTreeMap<String, String>,
}

/// Cache prune selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneFilters {
    pub all: bool,
    pub filters: Vec<String>,
}

/// A connected build engine client.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Run a build and export its result. Progress goes to `progress`.
    async fn solve(
        &self,
        opts: SolveOptions,
        progress: OutputWriter,
    ) -> Result<SolveResponse, EngineError>;

    async fn prune(&self, filters: PruneFilters) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Dials build engine endpoints.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BuildEngine>, EngineError>;
}

/// Reads the runtime configuration of a pushed image from its registry.
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn image_config(&self, image: &str, insecure: bool) -> Result<ImageConfig, EngineError>;
}

/// Address of a build engine running in a worker pod.
pub fn engine_address(ip: &str, port: u16) -> String {
    format!("tcp://{ip}:{port}")
}
