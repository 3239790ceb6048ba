//! In-memory build engine collaborators for tests.
//!
//! `FakeEngine` snapshots the staged build context during `solve`, since
//! the real context directory is removed as soon as the build returns.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{
    BuildEngine, EngineConnector, EngineError, Export, ImageInspector, PruneFilters,
    SolveOptions, SolveResponse,
};
use crate::output::OutputWriter;
use crate::types::ImageConfig;

/// Shared, ordered record of collaborator calls.
pub type CallLog = Arc<Mutex<Vec<String>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One recorded `solve` call.
#[derive(Debug, Clone)]
pub struct RecordedSolve {
    pub options: SolveOptions,
    /// Files found under the context directory, keyed by relative path.
    pub files: BTreeMap<String, Vec<u8>>,
}

impl RecordedSolve {
    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

#[derive(Default)]
struct EngineState {
    solves: Vec<RecordedSolve>,
    prunes: Vec<PruneFilters>,
    closed: bool,
}

#[derive(Default)]
pub struct FakeEngine {
    address: String,
    tarball: Option<Vec<u8>>,
    failure: Option<String>,
    delay: Option<Duration>,
    log: CallLog,
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Tarball returned for `Export::Tar` solves.
    pub fn with_tarball(mut self, tarball: Vec<u8>) -> Self {
        self.tarball = Some(tarball);
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn solves(&self) -> Vec<RecordedSolve> {
        lock(&self.state).solves.clone()
    }

    pub fn prunes(&self) -> Vec<PruneFilters> {
        lock(&self.state).prunes.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn record(&self, call: String) {
        lock(&self.log).push(call);
    }
}

#[async_trait]
impl BuildEngine for FakeEngine {
    async fn solve(
        &self,
        opts: SolveOptions,
        progress: OutputWriter,
    ) -> Result<SolveResponse, EngineError> {
        self.record(format!("solve {}", self.address));
        let mut files = BTreeMap::new();
        snapshot_dir(&opts.context_dir, &opts.context_dir, &mut files);
        let export = opts.export.clone();
        lock(&self.state).solves.push(RecordedSolve {
            options: opts,
            files,
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(EngineError::Solve(message.clone()));
        }

        progress.line("#1 [internal] load build definition from Dockerfile");
        Ok(SolveResponse {
            tarball: match export {
                Export::Tar => Some(self.tarball.clone().unwrap_or_default()),
                Export::Image { .. } => None,
            },
            exporter_response: BTreeMap::new(),
        })
    }

    async fn prune(&self, filters: PruneFilters) -> Result<(), EngineError> {
        self.record(format!("prune {}", self.address));
        lock(&self.state).prunes.push(filters);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(format!("close {}", self.address));
        lock(&self.state).closed = true;
        Ok(())
    }
}

fn snapshot_dir(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            snapshot_dir(root, &path, out);
        } else if let (Ok(rel), Ok(content)) = (path.strip_prefix(root), std::fs::read(&path)) {
            out.insert(rel.to_string_lossy().into_owned(), content);
        }
    }
}

/// Connector handing out a fresh `FakeEngine` per dial.
#[derive(Default)]
pub struct FakeConnector {
    tarball: Option<Vec<u8>>,
    fail: bool,
    log: CallLog,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tarball(mut self, tarball: Vec<u8>) -> Self {
        self.tarball = Some(tarball);
        self
    }

    /// Make every dial fail.
    pub fn refusing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn engines(&self) -> Vec<Arc<FakeEngine>> {
        lock(&self.engines).clone()
    }
}

#[async_trait]
impl EngineConnector for FakeConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BuildEngine>, EngineError> {
        lock(&self.log).push(format!("connect {address}"));
        if self.fail {
            return Err(EngineError::Connect {
                address: address.to_string(),
                message: "connection refused".to_string(),
            });
        }
        let mut engine = FakeEngine::new(address).with_log(self.log.clone());
        if let Some(tarball) = &self.tarball {
            engine = engine.with_tarball(tarball.clone());
        }
        let engine = Arc::new(engine);
        lock(&self.engines).push(engine.clone());
        Ok(engine)
    }
}

/// Image registry with a fixed set of image configs.
#[derive(Default)]
pub struct FakeInspector {
    configs: Mutex<HashMap<String, ImageConfig>>,
}

impl FakeInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, image: &str, config: ImageConfig) {
        lock(&self.configs).insert(image.to_string(), config);
    }
}

#[async_trait]
impl ImageInspector for FakeInspector {
    async fn image_config(&self, image: &str, _insecure: bool) -> Result<ImageConfig, EngineError> {
        lock(&self.configs)
            .get(image)
            .cloned()
            .ok_or_else(|| EngineError::Inspect {
                image: image.to_string(),
                message: "manifest unknown".to_string(),
            })
    }
}
