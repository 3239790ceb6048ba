//! Exclusive leaser: one lease attempt per candidate, first winner out.
//!
//! A single actor task owns the table of running attempts. It takes
//! candidates from the readiness notifier and commands from any number of
//! `LeaserHandle` clones, so the table needs no lock and no caller can
//! race another on it.
//!
//! ```text
//! notifier ──candidates──▶ actor ──spawn──▶ LeaseAttempt (per pod)
//!                           ▲                   │ won
//! LeaserHandle ──commands───┘                   ▼
//!                                     results (capacity 1) ──▶ discoverer
//! ```
//!
//! The results channel closes only after the candidate stream has ended
//! and every attempt task has exited. Dropping every handle stops command
//! processing but cancels nothing: a published winner keeps its lease
//! until the parent token is cancelled.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kiln_cluster::ClusterApi;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::election::{AttemptState, LeaseAttempt, LeaseLock, LeaseTimings, lease_name, unique_identity};

#[derive(Debug, Clone)]
pub struct LeaserConfig {
    pub lease_prefix: String,
    /// Holder identity base; each attempt appends a unique suffix.
    pub holder: String,
    pub timings: LeaseTimings,
}

/// What the actor knows about its attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaserSnapshot {
    /// Pods an attempt was started for.
    pub attempts: BTreeSet<String>,
    /// Pods whose attempt was cancelled by a release.
    pub cancelled: BTreeSet<String>,
    /// Pods whose attempt task has exited.
    pub finished: BTreeSet<String>,
    pub released: bool,
}

enum Command {
    ReleaseAll {
        except: Option<String>,
        ack: oneshot::Sender<()>,
    },
    Snapshot(oneshot::Sender<LeaserSnapshot>),
}

/// Cheap, cloneable control handle for a running leaser.
#[derive(Clone)]
pub struct LeaserHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl LeaserHandle {
    /// Cancel every attempt except the one for `except`. Returns once the
    /// cancellations have been issued. Safe to call repeatedly and
    /// concurrently; attempts registered afterwards are not started.
    pub async fn release_all(&self, except: Option<&str>) {
        let (ack, done) = oneshot::channel();
        let cmd = Command::ReleaseAll {
            except: except.map(str::to_string),
            ack,
        };
        if self.commands.send(cmd).is_ok() {
            let _ = done.await;
        }
    }

    /// Current attempt bookkeeping; empty once the leaser has finished.
    pub async fn snapshot(&self) -> LeaserSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(tx)).is_err() {
            return LeaserSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }
}

pub struct ExclusiveLeaser;

impl ExclusiveLeaser {
    /// Start leasing candidates from `candidates`. Attempts run under
    /// child tokens of `parent`, so cancelling it stops all of them.
    pub fn spawn(
        cluster: Arc<dyn ClusterApi>,
        config: LeaserConfig,
        candidates: mpsc::Receiver<Pod>,
        parent: CancellationToken,
    ) -> (LeaserHandle, mpsc::Receiver<Pod>) {
        let (results_tx, results_rx) = mpsc::channel(1);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            cluster,
            config,
            parent,
            results: results_tx,
            attempts: HashMap::new(),
            tasks: JoinSet::new(),
            snapshot: LeaserSnapshot::default(),
        };
        tokio::spawn(actor.run(candidates, commands_rx));
        (LeaserHandle { commands: commands_tx }, results_rx)
    }
}

struct Actor {
    cluster: Arc<dyn ClusterApi>,
    config: LeaserConfig,
    parent: CancellationToken,
    results: mpsc::Sender<Pod>,
    attempts: HashMap<String, CancellationToken>,
    tasks: JoinSet<(String, AttemptState)>,
    snapshot: LeaserSnapshot,
}

impl Actor {
    async fn run(
        mut self,
        mut candidates: mpsc::Receiver<Pod>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut candidates_open = true;
        let mut commands_open = true;

        while candidates_open || !self.tasks.is_empty() {
            tokio::select! {
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle(cmd),
                    // The winner lives until the parent token is cancelled,
                    // not until the last handle goes away.
                    None => commands_open = false,
                },
                pod = candidates.recv(), if candidates_open => match pod {
                    Some(pod) => self.register(pod),
                    None => candidates_open = false,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok((name, state)) => {
                        debug!(pod = %name, ?state, "lease attempt finished");
                        self.snapshot.finished.insert(name);
                    }
                    Err(e) => warn!(error = %e, "lease attempt task failed"),
                },
            }
        }

        // Answer anything still queued before the handles observe the end.
        while let Ok(cmd) = commands.try_recv() {
            self.handle(cmd);
        }
        debug!("leaser finished, closing results");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::ReleaseAll { except, ack } => {
                self.release_all(except.as_deref());
                let _ = ack.send(());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot.clone());
            }
        }
    }

    fn register(&mut self, pod: Pod) {
        let Some(name) = pod.metadata.name.clone() else {
            return;
        };
        if self.attempts.contains_key(&name) {
            return;
        }
        if self.snapshot.released {
            debug!(pod = %name, "leaser already released, ignoring candidate");
            return;
        }

        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let lock = LeaseLock {
            name: lease_name(&self.config.lease_prefix, &name),
            namespace,
            identity: unique_identity(&self.config.holder),
        };
        let token = self.parent.child_token();
        let attempt = LeaseAttempt::new(self.cluster.clone(), lock, self.config.timings);
        let results = self.results.clone();
        let attempt_token = token.clone();
        let task_name = name.clone();
        self.tasks.spawn(async move {
            let state = attempt.run(attempt_token, pod, results).await;
            (task_name, state)
        });

        self.snapshot.attempts.insert(name.clone());
        self.attempts.insert(name, token);
    }

    fn release_all(&mut self, except: Option<&str>) {
        for (name, token) in &self.attempts {
            if Some(name.as_str()) == except || token.is_cancelled() {
                continue;
            }
            info!(pod = %name, "releasing lease attempt");
            token.cancel();
            self.snapshot.cancelled.insert(name.clone());
        }
        self.snapshot.released = true;
    }
}
