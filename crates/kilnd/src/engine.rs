//! Build engine collaborators of the daemon.
//!
//! The engine client is an external component reached through the
//! `EngineConnector` and `ImageInspector` traits. A daemon assembled
//! without one uses `UnlinkedEngine`: every build fails as unavailable
//! while health, metrics, and the worker downscaler keep running.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{BuildEngine, EngineConnector, EngineError, ImageConfig, ImageInspector};

const UNLINKED: &str = "no build engine client is linked into this daemon";

#[derive(Debug, Clone, Copy, Default)]
pub struct UnlinkedEngine;

#[async_trait]
impl EngineConnector for UnlinkedEngine {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BuildEngine>, EngineError> {
        Err(EngineError::Connect {
            address: address.to_string(),
            message: UNLINKED.to_string(),
        })
    }
}

#[async_trait]
impl ImageInspector for UnlinkedEngine {
    async fn image_config(&self, image: &str, _insecure: bool) -> Result<ImageConfig, EngineError> {
        Err(EngineError::Inspect {
            image: image.to_string(),
            message: UNLINKED.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use kiln_core::Code;

    use super::*;

    #[tokio::test]
    async fn every_dial_is_unavailable() {
        let err = UnlinkedEngine.connect("tcp://10.0.0.1:80").await.err().unwrap();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.to_string().contains("tcp://10.0.0.1:80"));

        let err = UnlinkedEngine.image_config("app:v1", false).await.unwrap_err();
        assert!(matches!(err, EngineError::Inspect { .. }));
    }
}
