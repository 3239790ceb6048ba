//! The build dispatcher.
//!
//! ```text
//! build(request)
//!   ├── validate                     (fail fast, no remote calls)
//!   ├── prepare descriptor + stage context dir
//!   ├── worker: discovered (app source/image builds) or static engine
//!   ├── [prune cache] ─▶ solve ─▶ export image
//!   ├── extract TsuruConfig
//!   │     source upload:  archive files, else image filesystem
//!   │     image/file:     registry config + image filesystem,
//!   │                     else staged context
//!   └── release worker (always)
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use kiln_core::metadata::DEFAULT_APP_WORKING_DIR;
use kiln_core::{
    BuildEngine, BuildOrigin, BuildRequest, EngineConnector, EngineError, Export, ImageConfig,
    ImageInspector, OutputWriter, PruneFilters, SolveOptions, TenantCategory, TsuruConfig,
    TsuruYamlData, validate_build_request,
};
use kiln_discovery::{CleanupStep, DiscoveryOptions, Release, WorkerDiscoverer};
use kiln_metrics::BuildMetrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::containerfile;
use crate::error::{BuildError, BuildResult};
use crate::extract::{self, AppFiles};
use crate::ports::sort_exposed_ports;
use crate::staging::{StageSpec, StagedContext, stage};

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Build engine used when discovery does not apply.
    pub engine_address: Option<String>,
    /// Enables worker discovery for app source and image builds.
    pub discovery: Option<DiscoveryOptions>,
    /// Prune the whole engine cache before every build.
    pub disable_cache: bool,
    /// Parent of staged contexts. System temp dir when unset.
    pub temp_dir: Option<PathBuf>,
}

/// An engine ready for one build.
struct Worker {
    engine: Arc<dyn BuildEngine>,
    /// Set for discovered workers; keys the build metrics.
    namespace: Option<String>,
    release: Release,
}

/// What is known before the build runs.
struct Prepared {
    spec: StageSpec,
    /// App files read from the uploaded archive.
    app_files: Option<AppFiles>,
}

pub struct BuildDispatcher {
    config: DispatcherConfig,
    connector: Arc<dyn EngineConnector>,
    inspector: Arc<dyn ImageInspector>,
    discoverer: Option<Arc<WorkerDiscoverer>>,
    metrics: Arc<BuildMetrics>,
}

impl BuildDispatcher {
    pub fn new(
        config: DispatcherConfig,
        connector: Arc<dyn EngineConnector>,
        inspector: Arc<dyn ImageInspector>,
        metrics: Arc<BuildMetrics>,
    ) -> Self {
        Self {
            config,
            connector,
            inspector,
            discoverer: None,
            metrics,
        }
    }

    /// Use `discoverer` for builds that support discovery. Only effective
    /// together with `DispatcherConfig::discovery`.
    pub fn with_discoverer(mut self, discoverer: Arc<WorkerDiscoverer>) -> Self {
        self.discoverer = Some(discoverer);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one build. Progress goes to `out`; the extracted platform
    /// configuration is returned on success.
    pub async fn build(
        &self,
        token: &CancellationToken,
        req: &BuildRequest,
        out: &OutputWriter,
    ) -> BuildResult<TsuruConfig> {
        if token.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        validate_build_request(req)?;
        let origin = req
            .kind
            .origin()
            .ok_or_else(|| BuildError::Internal(format!("no origin for kind {}", req.kind)))?;

        let prepared = prepare(origin, req)?;
        let staged = stage(self.config.temp_dir.as_deref(), prepared.spec, token).await?;

        let worker = self.worker(token, req, out).await?;
        let result = self
            .run(token, req, origin, prepared.app_files, &staged, &worker, out)
            .await;
        worker.release.run().await;

        if let Err(e) = &result {
            warn!(kind = %req.kind, error = %e, "build failed");
        }
        result
    }

    async fn worker(
        &self,
        token: &CancellationToken,
        req: &BuildRequest,
        out: &OutputWriter,
    ) -> BuildResult<Worker> {
        if req.kind.supports_discovery()
            && let (Some(discoverer), Some(opts)) = (&self.discoverer, &self.config.discovery)
        {
            let found = discoverer.discover(token, opts, req, out).await?;
            info!(
                namespace = %found.namespace,
                pod = %found.pod,
                address = %found.address,
                "building on discovered worker"
            );
            return Ok(Worker {
                engine: found.engine,
                namespace: Some(found.namespace),
                release: found.release,
            });
        }

        let Some(address) = &self.config.engine_address else {
            return Err(BuildError::NoEngine(req.kind.to_string()));
        };
        let engine = cancellable(token, self.connector.connect(address)).await?;
        debug!(%address, "building on static engine");
        let mut release = Release::new();
        release.push(CleanupStep::CloseEngine {
            address: address.clone(),
            engine: engine.clone(),
        });
        Ok(Worker {
            engine,
            namespace: None,
            release,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        token: &CancellationToken,
        req: &BuildRequest,
        origin: BuildOrigin,
        app_files: Option<AppFiles>,
        staged: &StagedContext,
        worker: &Worker,
        out: &OutputWriter,
    ) -> BuildResult<TsuruConfig> {
        let _active = worker
            .namespace
            .as_deref()
            .map(|ns| self.metrics.build_started(ns, req.kind.as_str()));
        let engine = worker.engine.as_ref();

        if self.config.disable_cache {
            debug!("pruning build cache");
            let filters = PruneFilters {
                all: true,
                ..Default::default()
            };
            cancellable(token, engine.prune(filters)).await?;
        }

        let export = Export::Image {
            names: req.destination_images.clone(),
            push: req.push_enabled(),
            insecure_registry: req.insecure_registry(),
        };
        cancellable(token, engine.solve(solve_options(staged, export), out.clone())).await?;

        if req.kind.tenant_category() == Some(TenantCategory::Platform) {
            return Ok(TsuruConfig::default());
        }

        match origin {
            BuildOrigin::SourceUpload => {
                let mut files = app_files.unwrap_or_default();
                if files.procfile.is_empty() {
                    debug!("no Procfile in the app source, reading it from the built image");
                    let image_files =
                        image_app_files(token, engine, staged, DEFAULT_APP_WORKING_DIR).await?;
                    files.procfile = image_files.procfile;
                    if files.tsuru_yaml.is_empty() {
                        files.tsuru_yaml = image_files.tsuru_yaml;
                    }
                }
                Ok(TsuruConfig {
                    procfile: files.procfile,
                    tsuru_yaml: files.tsuru_yaml,
                    image_config: None,
                })
            }
            BuildOrigin::ContainerImage | BuildOrigin::ContainerFile => {
                let image_config = self.image_config(token, req).await?;
                let working_dir = image_config
                    .as_ref()
                    .map(|c| c.working_dir.as_str())
                    .filter(|wd| !wd.is_empty())
                    .unwrap_or(DEFAULT_APP_WORKING_DIR);

                let mut files = image_app_files(token, engine, staged, working_dir).await?;
                if files.procfile.is_empty() || files.tsuru_yaml.is_empty() {
                    let context_files = extract::from_directory(staged.path())?;
                    if files.procfile.is_empty() {
                        files.procfile = context_files.procfile;
                    }
                    if files.tsuru_yaml.is_empty() {
                        files.tsuru_yaml = context_files.tsuru_yaml;
                    }
                }
                Ok(TsuruConfig {
                    procfile: files.procfile,
                    tsuru_yaml: files.tsuru_yaml,
                    image_config,
                })
            }
        }
    }

    /// Runtime config of the first destination image, read back from the
    /// registry. Images that were not pushed cannot be inspected.
    async fn image_config(
        &self,
        token: &CancellationToken,
        req: &BuildRequest,
    ) -> BuildResult<Option<ImageConfig>> {
        if !req.push_enabled() {
            debug!("image was not pushed, skipping image config");
            return Ok(None);
        }
        let Some(image) = req.destination_images.first() else {
            return Ok(None);
        };
        let mut config = cancellable(
            token,
            self.inspector.image_config(image, req.insecure_registry()),
        )
        .await?;
        config.exposed_ports = sort_exposed_ports(std::mem::take(&mut config.exposed_ports));
        Ok(Some(config))
    }
}

fn prepare(origin: BuildOrigin, req: &BuildRequest) -> BuildResult<Prepared> {
    Ok(match origin {
        BuildOrigin::SourceUpload => {
            let files = extract::from_source_archive(&req.data)?;
            let tsuru_yaml = TsuruYamlData::parse(&files.tsuru_yaml)?;
            Prepared {
                spec: StageSpec {
                    containerfile: containerfile::source_upload(
                        &req.source_image,
                        tsuru_yaml.build_hooks(),
                    ),
                    app_archive: Some(req.data.clone()),
                    context_archive: None,
                    env: req.build_env(),
                },
                app_files: Some(files),
            }
        }
        BuildOrigin::ContainerImage => Prepared {
            spec: StageSpec {
                containerfile: containerfile::from_image(&req.source_image),
                ..Default::default()
            },
            app_files: None,
        },
        BuildOrigin::ContainerFile => Prepared {
            spec: StageSpec {
                containerfile: req.containerfile.clone(),
                app_archive: None,
                context_archive: (!req.data.is_empty()).then(|| req.data.clone()),
                env: req.build_env(),
            },
            app_files: None,
        },
    })
}

fn solve_options(staged: &StagedContext, export: Export) -> SolveOptions {
    let mut opts = SolveOptions::dockerfile(staged.path(), export);
    opts.secrets = staged.secrets();
    opts
}

/// Re-solve the staged context and read the app files from the exported
/// filesystem.
async fn image_app_files(
    token: &CancellationToken,
    engine: &dyn BuildEngine,
    staged: &StagedContext,
    working_dir: &str,
) -> BuildResult<AppFiles> {
    let response = cancellable(
        token,
        engine.solve(solve_options(staged, Export::Tar), OutputWriter::discard()),
    )
    .await?;
    let tarball = response
        .tarball
        .ok_or_else(|| BuildError::Internal("engine returned no filesystem tarball".to_string()))?;
    extract::from_image_tarball(&tarball, working_dir)
}

async fn cancellable<T>(
    token: &CancellationToken,
    call: impl Future<Output = Result<T, EngineError>>,
) -> BuildResult<T> {
    tokio::select! {
        _ = token.cancelled() => Err(BuildError::Cancelled),
        result = call => result.map_err(BuildError::from),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use kiln_cluster::fake::{FakeCluster, ready_pod};
    use kiln_core::testing::{CallLog, FakeConnector, FakeInspector};
    use kiln_core::{BuildKind, Code, PushOptions, Tenant, TsuruApp, TsuruJob, TsuruPlatform};
    use kiln_discovery::LeaseTimings;

    use super::*;
    use crate::test_support::{gzip_tar, plain_tar};

    const ADDRESS: &str = "tcp://buildkitd:1234";

    fn app(name: &str) -> Option<Tenant> {
        Some(Tenant::App(TsuruApp {
            name: name.to_string(),
            team: "admin".to_string(),
            env_vars: BTreeMap::from([
                ("MY_ENV".to_string(), "tenant".to_string()),
                ("DATABASE_PASSWORD".to_string(), "s3cr3t".to_string()),
            ]),
        }))
    }

    fn source_request(data: Vec<u8>) -> BuildRequest {
        BuildRequest {
            kind: BuildKind::AppBuildWithSourceUpload,
            tenant: app("my-app"),
            source_image: "tsuru/python:3.12".to_string(),
            destination_images: vec!["registry.example/tsuru/app-my-app:v1".to_string()],
            data,
            env: BTreeMap::from([("MY_ENV".to_string(), "request".to_string())]),
            ..Default::default()
        }
    }

    fn image_request(kind: BuildKind, tenant: Option<Tenant>) -> BuildRequest {
        BuildRequest {
            kind,
            tenant,
            source_image: "docker.io/library/nginx:1.27".to_string(),
            destination_images: vec![
                "registry.example/tsuru/app-web:v2".to_string(),
                "registry.example/tsuru/app-web:latest".to_string(),
            ],
            ..Default::default()
        }
    }

    struct Setup {
        connector: Arc<FakeConnector>,
        inspector: Arc<FakeInspector>,
        metrics: Arc<BuildMetrics>,
    }

    impl Setup {
        fn new(connector: FakeConnector) -> Self {
            Self {
                connector: Arc::new(connector),
                inspector: Arc::new(FakeInspector::new()),
                metrics: BuildMetrics::new(),
            }
        }

        fn dispatcher(&self, config: DispatcherConfig) -> BuildDispatcher {
            BuildDispatcher::new(
                config,
                self.connector.clone(),
                self.inspector.clone(),
                self.metrics.clone(),
            )
        }

        fn static_dispatcher(&self) -> BuildDispatcher {
            self.dispatcher(DispatcherConfig {
                engine_address: Some(ADDRESS.to_string()),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn validation_fails_before_any_remote_call() {
        let setup = Setup::new(FakeConnector::new());
        let dispatcher = setup.static_dispatcher();

        let mut req = source_request(gzip_tar(&[("Procfile", "web: x")]));
        req.destination_images.clear();
        let err = dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "destination images not provided");
        assert_eq!(err.code(), Code::InvalidArgument);

        req.destination_images = vec![String::new()];
        let err = dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "destination image cannot be empty");
        assert!(setup.connector.engines().is_empty());
    }

    #[tokio::test]
    async fn source_upload_with_procfile_in_archive() {
        let setup = Setup::new(FakeConnector::new());
        let dispatcher = setup.static_dispatcher();
        let data = gzip_tar(&[
            ("Procfile", "web: gunicorn app:app\n"),
            ("tsuru.yaml", "hooks:\n  build:\n    - pip install -r requirements.txt\n"),
        ]);
        let (out, mut rx) = OutputWriter::channel();

        let config = dispatcher
            .build(&CancellationToken::new(), &source_request(data.clone()), &out)
            .await
            .unwrap();
        assert_eq!(config.procfile, "web: gunicorn app:app\n");
        assert_eq!(
            config.tsuru_yaml,
            "hooks:\n  build:\n    - pip install -r requirements.txt\n"
        );
        assert_eq!(config.image_config, None);

        let engines = setup.connector.engines();
        assert_eq!(engines.len(), 1);
        let engine = &engines[0];
        assert!(engine.is_closed());
        assert!(engine.prunes().is_empty());

        let solves = engine.solves();
        assert_eq!(solves.len(), 1);
        let solve = &solves[0];
        assert_eq!(
            solve.options.export,
            Export::Image {
                names: vec!["registry.example/tsuru/app-my-app:v1".to_string()],
                push: true,
                insecure_registry: false,
            }
        );
        let dockerfile = solve.file("Dockerfile").unwrap();
        assert!(dockerfile.starts_with("FROM tsuru/python:3.12\n"));
        assert!(dockerfile.contains("&& { pip install -r requirements.txt; } \\\n"));
        assert_eq!(solve.files.get("application.tar.gz"), Some(&data));

        let env = solve.file("envs.sh").unwrap();
        assert!(env.contains("export MY_ENV=request\n"));
        assert!(env.contains("export DATABASE_PASSWORD=s3cr3t\n"));
        assert_eq!(solve.options.secrets.len(), 1);
        assert_eq!(solve.options.secrets[0].id, "tsuru-app-envvars");

        drop(out);
        let mut progress = Vec::new();
        while let Some(msg) = rx.recv().await {
            progress.push(msg);
        }
        assert!(!progress.is_empty());
    }

    #[tokio::test]
    async fn source_upload_reads_procfile_from_image() {
        let image_fs = plain_tar(&[
            ("home/application/current/Procfile", "web: ./bin/start\n"),
            ("home/application/current/tsuru.yml", "healthcheck:\n  path: /\n"),
        ]);
        let setup = Setup::new(FakeConnector::new().with_tarball(image_fs));
        let dispatcher = setup.static_dispatcher();
        let data = gzip_tar(&[("main.go", "package main")]);

        let config = dispatcher
            .build(&CancellationToken::new(), &source_request(data), &OutputWriter::discard())
            .await
            .unwrap();
        assert_eq!(config.procfile, "web: ./bin/start\n");
        assert_eq!(config.tsuru_yaml, "healthcheck:\n  path: /\n");

        let solves = setup.connector.engines()[0].solves();
        assert_eq!(solves.len(), 2);
        assert_eq!(solves[1].options.export, Export::Tar);
        assert_eq!(solves[1].options.context_dir, solves[0].options.context_dir);
    }

    #[tokio::test]
    async fn source_upload_rejects_non_gzip_data() {
        let setup = Setup::new(FakeConnector::new());
        let err = setup
            .static_dispatcher()
            .build(
                &CancellationToken::new(),
                &source_request(b"plain".to_vec()),
                &OutputWriter::discard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::NotGzip(_)));
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(setup.connector.engines().is_empty());
    }

    #[tokio::test]
    async fn container_image_build_collects_image_config() {
        let image_fs = plain_tar(&[
            ("app/Procfile", "web: nginx -g 'daemon off;'\n"),
            ("app/tsuru.yaml", "hooks: {}\n"),
        ]);
        let setup = Setup::new(FakeConnector::new().with_tarball(image_fs));
        setup.inspector.insert(
            "registry.example/tsuru/app-web:v2",
            ImageConfig {
                entrypoint: vec!["/docker-entrypoint.sh".to_string()],
                cmd: vec!["nginx".to_string(), "-g".to_string(), "daemon off;".to_string()],
                working_dir: "/app".to_string(),
                exposed_ports: vec!["8080/tcp".to_string(), "443/tcp".to_string(), "80/tcp".to_string()],
            },
        );
        let dispatcher = setup.static_dispatcher();

        let req = image_request(BuildKind::AppBuildWithContainerImage, app("web"));
        let config = dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap();

        assert_eq!(config.procfile, "web: nginx -g 'daemon off;'\n");
        assert_eq!(config.tsuru_yaml, "hooks: {}\n");
        let image_config = config.image_config.unwrap();
        assert_eq!(image_config.working_dir, "/app");
        assert_eq!(image_config.exposed_ports, vec!["80/tcp", "443/tcp", "8080/tcp"]);

        let solves = setup.connector.engines()[0].solves();
        assert_eq!(solves[0].file("Dockerfile").unwrap(), "FROM docker.io/library/nginx:1.27\n");
        assert!(solves[0].options.secrets.is_empty());
        match &solves[0].options.export {
            Export::Image { names, .. } => assert_eq!(names.len(), 2),
            other => panic!("unexpected export {other:?}"),
        }
    }

    #[tokio::test]
    async fn containerfile_falls_back_to_context_files() {
        let setup = Setup::new(FakeConnector::new().with_tarball(plain_tar(&[])));
        setup.inspector.insert("registry.example/tsuru/app-web:v2", ImageConfig::default());
        let dispatcher = setup.static_dispatcher();

        let mut req = image_request(
            BuildKind::JobDeployWithContainerFile,
            Some(Tenant::Job(TsuruJob {
                name: "nightly".to_string(),
                ..Default::default()
            })),
        );
        req.containerfile = "FROM busybox\nCOPY . /home/application/current\n".to_string();
        req.data = gzip_tar(&[("Procfile", "cron: ./run.sh\n"), ("run.sh", "echo hi")]);

        let config = dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap();
        assert_eq!(config.procfile, "cron: ./run.sh\n");
        assert_eq!(config.image_config, Some(ImageConfig::default()));

        let solves = setup.connector.engines()[0].solves();
        assert_eq!(solves[0].file("run.sh").unwrap(), "echo hi");
        assert_eq!(solves[1].options.export, Export::Tar);
    }

    #[tokio::test]
    async fn unpushed_image_is_not_inspected() {
        let setup = Setup::new(FakeConnector::new().with_tarball(plain_tar(&[])));
        let dispatcher = setup.static_dispatcher();
        let mut req = image_request(BuildKind::AppBuildWithContainerImage, app("web"));
        req.push_options = Some(PushOptions {
            disable: true,
            insecure_registry: true,
        });

        let config = dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap();
        assert_eq!(config.image_config, None);
        match &setup.connector.engines()[0].solves()[0].options.export {
            Export::Image {
                push,
                insecure_registry,
                ..
            } => {
                assert!(!push);
                assert!(insecure_registry);
            }
            other => panic!("unexpected export {other:?}"),
        }
    }

    #[tokio::test]
    async fn platform_build_returns_empty_config() {
        let setup = Setup::new(FakeConnector::new());
        let dispatcher = setup.static_dispatcher();
        let mut req = image_request(
            BuildKind::PlatformWithContainerFile,
            Some(Tenant::Platform(TsuruPlatform {
                name: "python".to_string(),
            })),
        );
        req.containerfile = "FROM ubuntu:24.04\nRUN apt-get update\n".to_string();

        let config = dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap();
        assert_eq!(config, TsuruConfig::default());
        assert_eq!(setup.connector.engines()[0].solves().len(), 1);
    }

    #[tokio::test]
    async fn disabled_cache_prunes_before_solving() {
        let log = CallLog::default();
        let setup = Setup::new(FakeConnector::new().with_log(log.clone()));
        let dispatcher = setup.dispatcher(DispatcherConfig {
            engine_address: Some(ADDRESS.to_string()),
            disable_cache: true,
            ..Default::default()
        });
        let req = source_request(gzip_tar(&[("Procfile", "web: x")]));
        dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                format!("connect {ADDRESS}"),
                format!("prune {ADDRESS}"),
                format!("solve {ADDRESS}"),
                format!("close {ADDRESS}"),
            ]
        );
        assert!(setup.connector.engines()[0].prunes()[0].all);
    }

    #[tokio::test]
    async fn no_engine_configured() {
        let setup = Setup::new(FakeConnector::new());
        let err = setup
            .dispatcher(DispatcherConfig::default())
            .build(
                &CancellationToken::new(),
                &source_request(gzip_tar(&[("Procfile", "web: x")])),
                &OutputWriter::discard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::NoEngine(_)));
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn engine_errors_pass_through() {
        let setup = Setup::new(FakeConnector::new().refusing());
        let err = setup
            .static_dispatcher()
            .build(
                &CancellationToken::new(),
                &source_request(gzip_tar(&[("Procfile", "web: x")])),
                &OutputWriter::discard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Engine(EngineError::Connect { .. })));
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn cancelled_build_is_not_started() {
        let setup = Setup::new(FakeConnector::new());
        let token = CancellationToken::new();
        token.cancel();
        let err = setup
            .static_dispatcher()
            .build(
                &token,
                &source_request(gzip_tar(&[("Procfile", "web: x")])),
                &OutputWriter::discard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn discovered_worker_is_used_and_released() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pod(ready_pod("buildkit", "buildkit-0", "10.1.2.3", &[("app", "buildkit")]));
        let setup = Setup::new(FakeConnector::new());
        let discoverer = WorkerDiscoverer::new(
            cluster.clone(),
            setup.connector.clone(),
            setup.metrics.clone(),
            "kilnd-test",
        )
        .with_timings(LeaseTimings {
            lease_duration: Duration::from_secs(2),
            renew_deadline: Duration::from_secs(1),
            retry_period: Duration::from_millis(50),
        });
        let dispatcher = setup
            .dispatcher(DispatcherConfig {
                engine_address: Some(ADDRESS.to_string()),
                discovery: Some(DiscoveryOptions {
                    namespace: "buildkit".to_string(),
                    timeout: Duration::from_secs(5),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .with_discoverer(Arc::new(discoverer));

        let req = source_request(gzip_tar(&[("Procfile", "web: x")]));
        dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap();

        let engines = setup.connector.engines();
        assert_eq!(engines.len(), 1);
        assert_eq!(engines[0].address(), "tcp://10.1.2.3:80");
        assert!(engines[0].is_closed());
        assert_eq!(
            setup
                .metrics
                .total("buildkit", "app_build_with_source_upload"),
            1
        );
        assert_eq!(setup.metrics.active("buildkit"), 0);
    }

    #[tokio::test]
    async fn discovery_does_not_apply_to_jobs() {
        let cluster = Arc::new(FakeCluster::new());
        let setup = Setup::new(FakeConnector::new().with_tarball(plain_tar(&[])));
        setup.inspector.insert("registry.example/tsuru/app-web:v2", ImageConfig::default());
        let discoverer =
            WorkerDiscoverer::new(cluster, setup.connector.clone(), setup.metrics.clone(), "kilnd-test");
        let dispatcher = setup
            .dispatcher(DispatcherConfig {
                engine_address: Some(ADDRESS.to_string()),
                discovery: Some(DiscoveryOptions::default()),
                ..Default::default()
            })
            .with_discoverer(Arc::new(discoverer));

        let req = image_request(
            BuildKind::JobCreateWithContainerImage,
            Some(Tenant::Job(TsuruJob {
                name: "nightly".to_string(),
                ..Default::default()
            })),
        );
        dispatcher
            .build(&CancellationToken::new(), &req, &OutputWriter::discard())
            .await
            .unwrap();
        assert_eq!(setup.connector.engines()[0].address(), ADDRESS);
        assert!(setup.metrics.snapshot().is_empty());
    }
}
