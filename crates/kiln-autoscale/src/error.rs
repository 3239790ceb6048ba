use kiln_cluster::ClusterError;
use thiserror::Error;

pub type ScaleResult<T> = Result<T, ScaleError>;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("statefulset {namespace}/{name}: {source}")]
    StatefulSet {
        namespace: String,
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to list worker pods: {0}")]
    ListPods(#[source] ClusterError),

    #[error("downscale pass panicked: {0}")]
    Panicked(String),
}
