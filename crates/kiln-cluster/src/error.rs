//! Cluster access error types.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("conflict writing {kind} {namespace}/{name}, object was modified")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("failed to fetch namespace in the App resource {0}")]
    MissingTenantNamespace(String),

    #[error("invalid patch for {namespace}/{name}: {message}")]
    InvalidPatch {
        namespace: String,
        name: String,
        message: String,
    },

    #[error("pod watch error: {0}")]
    Watch(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cluster request failed: {0}")]
    Request(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl ClusterError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    /// Translate a kube error for a specific object, folding 404 and 409
    /// responses into `NotFound` and `Conflict`.
    pub fn from_kube(err: kube::Error, kind: &'static str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            other => ClusterError::Kube(other),
        }
    }
}
