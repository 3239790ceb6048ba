//! Pod readiness notifier.
//!
//! Turns a pod watch into a stream of network-ready worker candidates.
//! The same pod may be emitted more than once as it keeps changing;
//! consumers de-duplicate by name.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kiln_cluster::{PodEvent, PodEventStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{DiscoveryError, DiscoveryResult};

/// Running, addressable, and reporting `Ready=True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    let ready = status
        .conditions
        .iter()
        .flatten()
        .filter(|c| c.type_ == "Ready")
        .next_back()
        .is_some_and(|c| c.status == "True");

    status.phase.as_deref() == Some("Running")
        && status.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty())
        && ready
}

pub struct PodNotifier {
    events: PodEventStream,
}

impl PodNotifier {
    pub fn new(events: PodEventStream) -> Self {
        Self { events }
    }

    /// Forward ready pods into `candidates` until `token` is cancelled or
    /// the watch ends.
    ///
    /// The watch is dropped before `candidates` is closed, so nothing is
    /// delivered after the consumer sees the channel end. A watch that
    /// ends on its own is reported as `NotifierClosed`.
    pub async fn run(
        self,
        token: CancellationToken,
        candidates: mpsc::Sender<Pod>,
    ) -> DiscoveryResult<()> {
        let PodNotifier { mut events } = self;

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                event = events.next() => event,
            };

            let pod = match event {
                None => {
                    error!("pod watcher channel closed unexpectedly");
                    break Err(DiscoveryError::NotifierClosed);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "pod watch error");
                    continue;
                }
                Some(Ok(PodEvent::Added(pod) | PodEvent::Modified(pod))) => pod,
                Some(Ok(PodEvent::Deleted(_))) => continue,
            };

            if !is_pod_ready(&pod) {
                debug!(
                    namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod = pod.metadata.name.as_deref().unwrap_or_default(),
                    "pod is not ready yet"
                );
                continue;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                sent = candidates.send(pod) => {
                    if sent.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        drop(events);
        drop(candidates);
        result
    }
}
