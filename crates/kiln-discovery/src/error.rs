//! Discovery error types.

use std::time::Duration;

use kiln_autoscale::ScaleError;
use kiln_cluster::ClusterError;
use kiln_core::{Code, EngineError};
use thiserror::Error;

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("there's only support for discovering workers from tsuru apps")]
    Unsupported,

    #[error("failed to resolve worker namespace for app {app}: {source}")]
    Namespace {
        app: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed trying upscale worker statefulset({namespace} - {statefulset}): {source}")]
    Upscale {
        namespace: String,
        statefulset: String,
        #[source]
        source: ScaleError,
    },

    #[error("failed to create pod watcher: {0}")]
    Watch(#[source] ClusterError),

    #[error("max deadline of {0:?} exceeded to discover worker pod")]
    DeadlineExceeded(Duration),

    #[error("worker discovery cancelled")]
    Cancelled,

    #[error("pod watcher channel closed unexpectedly")]
    NotifierClosed,

    #[error("leased pods channel was closed before acquiring any lease")]
    LeaseChannelClosed,

    #[error("failed to set tsuru app labels on worker pod: {0}")]
    Label(#[source] ClusterError),

    #[error("failed to determine lease holder identity: {0}")]
    Identity(String),

    #[error(transparent)]
    Connect(#[from] EngineError),
}

impl DiscoveryError {
    pub fn code(&self) -> Code {
        match self {
            DiscoveryError::Unsupported => Code::Unimplemented,
            DiscoveryError::DeadlineExceeded(_) => Code::DeadlineExceeded,
            DiscoveryError::Cancelled => Code::Cancelled,
            DiscoveryError::NotifierClosed | DiscoveryError::LeaseChannelClosed => {
                Code::Unavailable
            }
            DiscoveryError::Connect(e) => e.code(),
            _ => Code::Internal,
        }
    }
}
