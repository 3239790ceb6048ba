//! The streaming `Build` call.
//!
//! One request in, a stream of `BuildResponse` messages out: progress
//! text while the build runs, then the extracted `TsuruConfig`. Errors
//! end the stream; their `code()` tells the transport which status to
//! report.

use std::sync::Arc;

use kiln_core::{BuildRequest, BuildResponse, OutputWriter, validate_build_request};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::BuildDispatcher;
use crate::error::{BuildError, BuildResult};

pub const BUILD_STARTING_MESSAGE: &str = "---> Starting container image build";
pub const BUILD_FINISHED_MESSAGE: &str = "--> Container image build finished";

#[derive(Clone)]
pub struct BuildService {
    dispatcher: Arc<BuildDispatcher>,
}

impl BuildService {
    pub fn new(dispatcher: Arc<BuildDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Serve one build, writing every response message to `out`.
    pub async fn build(
        &self,
        token: &CancellationToken,
        req: &BuildRequest,
        out: &OutputWriter,
    ) -> BuildResult<()> {
        if token.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        validate_build_request(req)?;

        info!(kind = %req.kind, destinations = ?req.destination_images, "build requested");
        out.line(BUILD_STARTING_MESSAGE);

        let config = self.dispatcher.build(token, req, out).await?;

        out.line(BUILD_FINISHED_MESSAGE);
        if !out.config(config) {
            warn!(kind = %req.kind, "build caller went away before the tsuru config was sent");
        }
        info!(kind = %req.kind, "build finished");
        Ok(())
    }

    /// Run `build` on a task. The stream ends when the task does; the
    /// handle carries the outcome.
    pub fn spawn(
        &self,
        token: CancellationToken,
        req: BuildRequest,
    ) -> (
        mpsc::UnboundedReceiver<BuildResponse>,
        JoinHandle<BuildResult<()>>,
    ) {
        let (out, rx) = OutputWriter::channel();
        let service = self.clone();
        let handle = tokio::spawn(async move { service.build(&token, &req, &out).await });
        (rx, handle)
    }
}
