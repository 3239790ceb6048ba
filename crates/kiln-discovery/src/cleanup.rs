//! Release of a discovered worker.
//!
//! Discovery acquires resources one after another: the leader lease, the
//! tenant labels, the engine connection. `Release` records each as it is
//! acquired and undoes them in reverse order. Failures are logged and
//! never stop the remaining steps.

use std::fmt;
use std::sync::Arc;

use kiln_cluster::ClusterApi;
use kiln_core::BuildEngine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::labels::unset_tenant_labels;

pub enum CleanupStep {
    /// Cancel the leader-election context, which releases the lease.
    CancelLeader(CancellationToken),
    UnsetLabels {
        cluster: Arc<dyn ClusterApi>,
        namespace: String,
        pod: String,
        team_set: bool,
    },
    CloseEngine {
        address: String,
        engine: Arc<dyn BuildEngine>,
    },
}

impl CleanupStep {
    pub fn name(&self) -> &'static str {
        match self {
            CleanupStep::CancelLeader(_) => "cancel-leader",
            CleanupStep::UnsetLabels { .. } => "unset-labels",
            CleanupStep::CloseEngine { .. } => "close-engine",
        }
    }

    async fn run(self) {
        match self {
            CleanupStep::CancelLeader(token) => {
                debug!("releasing the worker lease");
                token.cancel();
            }
            CleanupStep::UnsetLabels {
                cluster,
                namespace,
                pod,
                team_set,
            } => {
                debug!(%namespace, %pod, "removing tenant labels from worker pod");
                if let Err(e) = unset_tenant_labels(cluster.as_ref(), &namespace, &pod, team_set).await {
                    error!(%namespace, %pod, error = %e, "failed to unset tenant labels");
                }
            }
            CleanupStep::CloseEngine { address, engine } => {
                debug!(%address, "closing build engine connection");
                if let Err(e) = engine.close().await {
                    warn!(%address, error = %e, "failed to close build engine connection");
                }
            }
        }
    }
}

/// LIFO stack of cleanup steps.
///
/// Call `run` when the build is done. A `Release` dropped without being
/// run still cleans up: on a Tokio runtime the steps are spawned,
/// otherwise only the leader contexts are cancelled.
#[derive(Default)]
pub struct Release {
    steps: Vec<CleanupStep>,
}

impl Release {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: CleanupStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in the order `run` executes them.
    pub fn plan(&self) -> Vec<&'static str> {
        self.steps.iter().rev().map(CleanupStep::name).collect()
    }

    pub async fn run(mut self) {
        run_steps(std::mem::take(&mut self.steps)).await;
    }
}

async fn run_steps(mut steps: Vec<CleanupStep>) {
    while let Some(step) = steps.pop() {
        step.run().await;
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        let steps = std::mem::take(&mut self.steps);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_steps(steps));
            }
            Err(_) => {
                for step in steps {
                    if let CleanupStep::CancelLeader(token) = step {
                        token.cancel();
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Release").field("plan", &self.plan()).finish()
    }
}
