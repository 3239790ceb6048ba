//! Lease-based leader election for a single worker pod.
//!
//! One `LeaseAttempt` races for the coordination lease guarding one pod.
//! It follows the usual renew-or-fail protocol: a lease held by someone
//! else is only taken over once its holder has not renewed it for a
//! full lease duration, measured on the local clock from when the
//! current record was first observed.
//!
//! ```text
//! Attempting ──acquired──▶ Won ──publish──▶ renewing ──cancel──▶ release
//!     │                                        │
//!     └──cancel──▶ Cancelled                   └──renew deadline missed──▶ lost
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kiln_cluster::{ClusterApi, ClusterResult};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};

/// Lease duration written into released leases.
const RELEASED_LEASE_DURATION_SECS: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimings {
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// How long the holder keeps retrying a renewal before giving up.
    pub renew_deadline: Duration,
    /// Delay between acquire or renew attempts.
    pub retry_period: Duration,
}

impl Default for LeaseTimings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(5),
            renew_deadline: Duration::from_secs(2),
            retry_period: Duration::from_millis(500),
        }
    }
}

/// Name of the lease guarding `pod`: `<prefix>-<pod>`, with trailing
/// dashes trimmed from the prefix.
pub fn lease_name(prefix: &str, pod: &str) -> String {
    format!("{}-{}", prefix.trim_end_matches('-'), pod)
}

/// Process-wide base of holder identities: `POD_NAME`, else the host name.
pub fn holder_base() -> DiscoveryResult<String> {
    if let Ok(name) = std::env::var("POD_NAME")
        && !name.is_empty()
    {
        return Ok(name);
    }
    let host = hostname::get()
        .map_err(|e| DiscoveryError::Identity(format!("cannot read the host name: {e}")))?;
    host.into_string()
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DiscoveryError::Identity("neither POD_NAME nor a usable host name is set".to_string()))
}

/// Holder identity for one attempt; the nanosecond suffix keeps
/// concurrent discoveries of the same process apart.
pub fn unique_identity(base: &str) -> String {
    let now = Utc::now();
    format!(
        "{base}-{}",
        now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros())
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseLock {
    pub namespace: String,
    pub name: String,
    pub identity: String,
}

/// Terminal state of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Attempting,
    Won,
    Cancelled,
}

pub struct LeaseAttempt {
    cluster: Arc<dyn ClusterApi>,
    lock: LeaseLock,
    timings: LeaseTimings,
    state: AttemptState,
    observed: Option<(LeaseSpec, Instant)>,
}

impl LeaseAttempt {
    pub fn new(cluster: Arc<dyn ClusterApi>, lock: LeaseLock, timings: LeaseTimings) -> Self {
        Self {
            cluster,
            lock,
            timings,
            state: AttemptState::Attempting,
            observed: None,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Race for the lease and, once won, publish `pod` on `results`.
    ///
    /// A winner keeps renewing in the background until `token` is
    /// cancelled, then releases the lease. If `token` fires before the
    /// result could be delivered, the result is dropped.
    pub async fn run(
        mut self,
        token: CancellationToken,
        pod: Pod,
        results: mpsc::Sender<Pod>,
    ) -> AttemptState {
        debug!(
            namespace = %self.lock.namespace,
            lease = %self.lock.name,
            holder = %self.lock.identity,
            "attempting to acquire lease"
        );

        if !self.acquire(&token).await {
            self.state = AttemptState::Cancelled;
            debug!(lease = %self.lock.name, "lease attempt cancelled");
            return self.state;
        }
        self.state = AttemptState::Won;
        info!(namespace = %self.lock.namespace, lease = %self.lock.name, "acquired worker lease");

        let delivered = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(lease = %self.lock.name, "cancelled before the winner was published");
                false
            }
            sent = results.send(pod) => sent.is_ok(),
        };
        drop(results);

        if delivered {
            self.hold(&token).await;
        }
        self.release().await;
        self.state
    }

    async fn acquire(&mut self, token: &CancellationToken) -> bool {
        loop {
            if token.is_cancelled() {
                return false;
            }
            if self.try_acquire_or_renew().await {
                return true;
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.timings.retry_period) => {}
            }
        }
    }

    /// Renew until cancelled or until a renewal misses its deadline.
    async fn hold(&mut self, token: &CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.timings.retry_period) => {}
            }

            let deadline = self.timings.renew_deadline;
            let retry = self.timings.retry_period;
            let renewed = tokio::select! {
                _ = token.cancelled() => return,
                renewed = tokio::time::timeout(deadline, async {
                    while !self.try_acquire_or_renew().await {
                        tokio::time::sleep(retry).await;
                    }
                }) => renewed.is_ok(),
            };
            if !renewed {
                warn!(lease = %self.lock.name, "failed to renew worker lease, lost it");
                return;
            }
        }
    }

    fn record(&self, acquired: DateTime<Utc>, renewed: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.lock.identity.clone()),
            lease_duration_seconds: Some(self.timings.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(acquired)),
            renew_time: Some(MicroTime(renewed)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// One acquire-or-renew round. Any failure, including a lost write
    /// race, just reports `false`.
    async fn try_acquire_or_renew(&mut self) -> bool {
        let now = Utc::now();
        let lock = self.lock.clone();
        let (ns, name) = (&lock.namespace, &lock.name);

        let existing = match self.cluster.get_lease(ns, name).await {
            Ok(lease) => lease,
            Err(e) => {
                debug!(lease = %name, error = %e, "failed to read lease");
                return false;
            }
        };

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(ns.clone()),
                    ..Default::default()
                },
                spec: Some(self.record(now, now, 0)),
            };
            return match self.cluster.create_lease(ns, &lease).await {
                Ok(created) => {
                    self.observe(created.spec.unwrap_or_default());
                    true
                }
                Err(e) => {
                    debug!(lease = %name, error = %e, "failed to create lease");
                    false
                }
            };
        };

        let current = lease.spec.clone().unwrap_or_default();
        let seen = match &self.observed {
            Some((spec, at)) if *spec == current => Some(*at),
            _ => None,
        };
        let observed_at = match seen {
            Some(at) => at,
            None => self.observe(current.clone()),
        };

        let holder = current.holder_identity.as_deref().unwrap_or_default();
        let is_holder = holder == self.lock.identity;
        if !holder.is_empty() && !is_holder {
            let duration = current.lease_duration_seconds.unwrap_or_default().max(0) as u64;
            if observed_at.elapsed() < Duration::from_secs(duration) {
                return false;
            }
        }

        let transitions = current.lease_transitions.unwrap_or_default();
        lease.spec = Some(if is_holder {
            let acquired = current.acquire_time.map(|t| t.0).unwrap_or(now);
            self.record(acquired, now, transitions)
        } else {
            self.record(now, now, transitions + 1)
        });

        match self.cluster.replace_lease(ns, &lease).await {
            Ok(updated) => {
                self.observe(updated.spec.unwrap_or_default());
                true
            }
            Err(e) => {
                debug!(lease = %name, error = %e, "failed to update lease");
                false
            }
        }
    }

    fn observe(&mut self, spec: LeaseSpec) -> Instant {
        let at = Instant::now();
        self.observed = Some((spec, at));
        at
    }

    /// Hand the lease back so the pod is immediately available to others.
    async fn release(&mut self) {
        match tokio::time::timeout(self.timings.renew_deadline, self.try_release()).await {
            Ok(Ok(true)) => debug!(lease = %self.lock.name, "released worker lease"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(lease = %self.lock.name, error = %e, "failed to release lease"),
            Err(_) => warn!(lease = %self.lock.name, "timed out releasing lease"),
        }
    }

    async fn try_release(&self) -> ClusterResult<bool> {
        let (ns, name) = (&self.lock.namespace, &self.lock.name);
        let Some(mut lease) = self.cluster.get_lease(ns, name).await? else {
            return Ok(false);
        };
        let current = lease.spec.clone().unwrap_or_default();
        if current.holder_identity.as_deref() != Some(self.lock.identity.as_str()) {
            return Ok(false);
        }
        let now = Utc::now();
        lease.spec = Some(LeaseSpec {
            holder_identity: None,
            lease_duration_seconds: Some(RELEASED_LEASE_DURATION_SECS),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: current.lease_transitions,
            ..Default::default()
        });
        self.cluster.replace_lease(ns, &lease).await?;
        Ok(true)
    }
}
