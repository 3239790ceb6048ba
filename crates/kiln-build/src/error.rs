use std::io;
use std::path::PathBuf;

use kiln_core::{Code, EngineError, ValidationError};
use kiln_discovery::DiscoveryError;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Passed through from the build engine unchanged.
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("app source data must be a GZIP compressed file: {0}")]
    NotGzip(#[source] io::Error),

    #[error("failed to read archive: {0}")]
    Archive(#[source] io::Error),

    #[error("failed to parse tsuru.yaml: {0}")]
    TsuruYaml(#[from] serde_yaml::Error),

    #[error("invalid environment variable name {0:?}")]
    InvalidEnvName(String),

    #[error("failed to stage build context in {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no build engine available: neither an engine address nor worker discovery is configured for {0} builds")]
    NoEngine(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("internal build error: {0}")]
    Internal(String),
}

impl BuildError {
    pub fn code(&self) -> Code {
        match self {
            BuildError::Validation(e) => e.code(),
            BuildError::Discovery(e) => e.code(),
            BuildError::Engine(e) => e.code(),
            BuildError::NotGzip(_) | BuildError::TsuruYaml(_) | BuildError::InvalidEnvName(_) => {
                Code::InvalidArgument
            }
            BuildError::NoEngine(_) => Code::Unavailable,
            BuildError::Cancelled => Code::Cancelled,
            BuildError::Archive(_) | BuildError::Staging { .. } | BuildError::Internal(_) => {
                Code::Internal
            }
        }
    }
}
