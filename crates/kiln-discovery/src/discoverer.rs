//! Worker discovery for a single build.
//!
//! ```text
//! discover(request)
//!   ├── namespace: static, or the tenant's App resource
//!   ├── upscale statefulset from zero (optional)
//!   ├── watch pods ─▶ PodNotifier ─▶ ExclusiveLeaser ─▶ first winner
//!   │                                   (deadline / cancel / notifier error)
//!   ├── release every other attempt
//!   ├── tag the pod with tenant labels (optional)
//!   └── dial tcp://<pod ip>:<port>
//! ```
//!
//! Every acquired resource is pushed onto the returned `Release`, which
//! undoes them in reverse order.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kiln_autoscale::upscale;
use kiln_cluster::ClusterApi;
use kiln_core::{BuildEngine, BuildRequest, EngineConnector, OutputWriter, engine_address};
use kiln_metrics::BuildMetrics;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupStep, Release};
use crate::election::LeaseTimings;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::labels::set_tenant_labels;
use crate::leaser::{ExclusiveLeaser, LeaserConfig};
use crate::notifier::PodNotifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Label selector of worker pods.
    pub pod_selector: String,
    /// Namespace of the worker pool, unless `use_tenant_namespace` is set.
    pub namespace: String,
    pub lease_prefix: String,
    /// Worker statefulset scaled up from zero before waiting for pods.
    pub statefulset: Option<String>,
    /// Port the build engine listens on inside worker pods.
    pub port: u16,
    pub scaling_disabled: bool,
    /// Look for workers in the namespace the tenant app runs in.
    pub use_tenant_namespace: bool,
    pub set_tenant_labels: bool,
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            pod_selector: "app=buildkit".to_string(),
            namespace: "default".to_string(),
            lease_prefix: "kiln".to_string(),
            statefulset: None,
            port: 80,
            scaling_disabled: false,
            use_tenant_namespace: false,
            set_tenant_labels: false,
            timeout: Duration::from_secs(300),
        }
    }
}

/// A leased, connected worker.
pub struct DiscoveredWorker {
    pub engine: Arc<dyn BuildEngine>,
    pub address: String,
    pub namespace: String,
    pub pod: String,
    /// Undo everything discovery did. Must be run once the build is over.
    pub release: Release,
}

impl std::fmt::Debug for DiscoveredWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredWorker")
            .field("address", &self.address)
            .field("namespace", &self.namespace)
            .field("pod", &self.pod)
            .field("release", &self.release)
            .finish()
    }
}

pub struct WorkerDiscoverer {
    cluster: Arc<dyn ClusterApi>,
    connector: Arc<dyn EngineConnector>,
    metrics: Arc<BuildMetrics>,
    holder: String,
    timings: LeaseTimings,
}

impl WorkerDiscoverer {
    /// `holder` is the base of lease holder identities, usually from
    /// `election::holder_base`.
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        connector: Arc<dyn EngineConnector>,
        metrics: Arc<BuildMetrics>,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            connector,
            metrics,
            holder: holder.into(),
            timings: LeaseTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: LeaseTimings) -> Self {
        self.timings = timings;
        self
    }

    pub async fn discover(
        &self,
        token: &CancellationToken,
        opts: &DiscoveryOptions,
        req: &BuildRequest,
        out: &OutputWriter,
    ) -> DiscoveryResult<DiscoveredWorker> {
        let app = req.app().ok_or(DiscoveryError::Unsupported)?;
        let namespace = self.worker_namespace(opts, &app.name).await?;

        let leader = token.child_token();
        let mut release = Release::new();
        release.push(CleanupStep::CancelLeader(leader.clone()));

        let pod = match self.discover_pod(&leader, opts, &namespace, out).await {
            Ok(pod) => pod,
            Err(e) => {
                release.run().await;
                return Err(e);
            }
        };
        let pod_name = pod.metadata.name.clone().unwrap_or_default();

        if opts.set_tenant_labels {
            debug!(%namespace, pod = %pod_name, "setting tenant labels on worker pod");
            match set_tenant_labels(self.cluster.as_ref(), &pod, app).await {
                Ok(team_set) => release.push(CleanupStep::UnsetLabels {
                    cluster: self.cluster.clone(),
                    namespace: namespace.clone(),
                    pod: pod_name.clone(),
                    team_set,
                }),
                Err(e) => {
                    release.run().await;
                    return Err(DiscoveryError::Label(e));
                }
            }
        }

        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default();
        let address = engine_address(ip, opts.port);
        let engine = match self.connector.connect(&address).await {
            Ok(engine) => engine,
            Err(e) => {
                warn!(%address, error = %e, "failed to connect to worker");
                release.run().await;
                return Err(e.into());
            }
        };
        release.push(CleanupStep::CloseEngine {
            address: address.clone(),
            engine: engine.clone(),
        });

        info!(%namespace, pod = %pod_name, %address, "connected to worker");
        Ok(DiscoveredWorker {
            engine,
            address,
            namespace,
            pod: pod_name,
            release,
        })
    }

    async fn worker_namespace(&self, opts: &DiscoveryOptions, app: &str) -> DiscoveryResult<String> {
        if !opts.use_tenant_namespace {
            return Ok(opts.namespace.clone());
        }
        debug!(%app, "resolving the namespace the app runs in");
        let namespace = self
            .cluster
            .tenant_namespace(app)
            .await
            .map_err(|source| DiscoveryError::Namespace {
                app: app.to_string(),
                source,
            })?;
        debug!(%app, %namespace, "resolved app namespace");
        Ok(namespace)
    }

    /// Wait for the first worker pod whose lease this process wins.
    ///
    /// Every other attempt has been cancelled by the time this returns,
    /// whatever the outcome.
    async fn discover_pod(
        &self,
        leader: &CancellationToken,
        opts: &DiscoveryOptions,
        namespace: &str,
        out: &OutputWriter,
    ) -> DiscoveryResult<Pod> {
        let _waiting = self.metrics.waiting_for_lease(namespace);

        if let Some(statefulset) = opts.statefulset.as_deref()
            && !statefulset.is_empty()
            && !opts.scaling_disabled
        {
            upscale(self.cluster.as_ref(), namespace, statefulset, out)
                .await
                .map_err(|source| DiscoveryError::Upscale {
                    namespace: namespace.to_string(),
                    statefulset: statefulset.to_string(),
                    source,
                })?;
        }

        let watch = leader.child_token();
        let _stop_watch = watch.clone().drop_guard();
        let events = self
            .cluster
            .watch_pods(namespace, &opts.pod_selector)
            .await
            .map_err(DiscoveryError::Watch)?;

        let (candidates_tx, candidates_rx) = mpsc::channel(1);
        let mut notifier = tokio::spawn(PodNotifier::new(events).run(watch, candidates_tx));
        let config = LeaserConfig {
            lease_prefix: opts.lease_prefix.clone(),
            holder: self.holder.clone(),
            timings: self.timings,
        };
        let (leaser, mut leased) =
            ExclusiveLeaser::spawn(self.cluster.clone(), config, candidates_rx, leader.clone());

        let outcome = tokio::select! {
            biased;
            _ = leader.cancelled() => Err(DiscoveryError::Cancelled),
            pod = leased.recv() => match pod {
                Some(pod) => Ok(pod),
                // Candidates only stop once the notifier is exiting.
                None => match (&mut notifier).await {
                    Ok(Err(e)) => Err(e),
                    _ => Err(DiscoveryError::LeaseChannelClosed),
                },
            },
            joined = &mut notifier => match joined {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(DiscoveryError::LeaseChannelClosed),
                Err(e) => {
                    warn!(error = %e, "pod notifier task failed");
                    Err(DiscoveryError::NotifierClosed)
                }
            },
            _ = tokio::time::sleep(opts.timeout) => Err(DiscoveryError::DeadlineExceeded(opts.timeout)),
        };

        match &outcome {
            Ok(pod) => leaser.release_all(pod.metadata.name.as_deref()).await,
            Err(e) => {
                warn!(%namespace, error = %e, "worker discovery failed");
                leaser.release_all(None).await;
            }
        }
        outcome
    }
}
