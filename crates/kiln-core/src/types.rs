//! Build request and response model.
//!
//! These types mirror the streaming `Build` call: a caller submits one
//! `BuildRequest` and receives a sequence of `BuildResponse` messages,
//! textual progress first and a final `TsuruConfig` on success.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Build kind ─────────────────────────────────────────────────────

/// What is being built, and on whose behalf.
///
/// Validation rules depend only on the kind (see `validate_build_request`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    /// Wire default; never valid.
    #[default]
    Unspecified,
    AppBuildWithSourceUpload,
    AppBuildWithContainerImage,
    AppBuildWithContainerFile,
    JobCreateWithContainerImage,
    JobDeployWithContainerImage,
    JobDeployWithContainerFile,
    PlatformWithContainerFile,
}

/// Which tenant reference a kind requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantCategory {
    App,
    Job,
    Platform,
}

/// Where the image content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOrigin {
    /// A gzip tarball of application sources built on top of a platform image.
    SourceUpload,
    /// An existing image re-tagged and pushed to the destinations.
    ContainerImage,
    /// A caller-supplied Containerfile plus optional context archive.
    ContainerFile,
}

impl BuildKind {
    /// Map a wire enum value to a kind. Unknown values yield `None`.
    pub fn from_wire(value: i32) -> Option<Self> {
        Some(match value {
            0 => BuildKind::Unspecified,
            1 => BuildKind::AppBuildWithSourceUpload,
            2 => BuildKind::AppBuildWithContainerImage,
            3 => BuildKind::AppBuildWithContainerFile,
            4 => BuildKind::JobCreateWithContainerImage,
            5 => BuildKind::JobDeployWithContainerImage,
            6 => BuildKind::JobDeployWithContainerFile,
            7 => BuildKind::PlatformWithContainerFile,
            _ => return None,
        })
    }

    pub fn tenant_category(&self) -> Option<TenantCategory> {
        match self {
            BuildKind::Unspecified => None,
            BuildKind::AppBuildWithSourceUpload
            | BuildKind::AppBuildWithContainerImage
            | BuildKind::AppBuildWithContainerFile => Some(TenantCategory::App),
            BuildKind::JobCreateWithContainerImage
            | BuildKind::JobDeployWithContainerImage
            | BuildKind::JobDeployWithContainerFile => Some(TenantCategory::Job),
            BuildKind::PlatformWithContainerFile => Some(TenantCategory::Platform),
        }
    }

    pub fn origin(&self) -> Option<BuildOrigin> {
        match self {
            BuildKind::Unspecified => None,
            BuildKind::AppBuildWithSourceUpload => Some(BuildOrigin::SourceUpload),
            BuildKind::AppBuildWithContainerImage
            | BuildKind::JobCreateWithContainerImage
            | BuildKind::JobDeployWithContainerImage => Some(BuildOrigin::ContainerImage),
            BuildKind::AppBuildWithContainerFile
            | BuildKind::JobDeployWithContainerFile
            | BuildKind::PlatformWithContainerFile => Some(BuildOrigin::ContainerFile),
        }
    }

    /// Kinds that may be served by an autodiscovered worker.
    pub fn supports_discovery(&self) -> bool {
        matches!(
            self,
            BuildKind::AppBuildWithSourceUpload | BuildKind::AppBuildWithContainerImage
        )
    }

    /// Stable label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildKind::Unspecified => "unspecified",
            BuildKind::AppBuildWithSourceUpload => "app_build_with_source_upload",
            BuildKind::AppBuildWithContainerImage => "app_build_with_container_image",
            BuildKind::AppBuildWithContainerFile => "app_build_with_container_file",
            BuildKind::JobCreateWithContainerImage => "job_create_with_container_image",
            BuildKind::JobDeployWithContainerImage => "job_deploy_with_container_image",
            BuildKind::JobDeployWithContainerFile => "job_deploy_with_container_file",
            BuildKind::PlatformWithContainerFile => "platform_with_container_file",
        }
    }
}

impl std::fmt::Display for BuildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tenants ────────────────────────────────────────────────────────

/// A tsuru application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsuruApp {
    pub name: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// A tsuru job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsuruJob {
    pub name: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// A tsuru platform (base image for source builds).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsuruPlatform {
    pub name: String,
}

/// The entity a build is performed for. At most one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tenant {
    App(TsuruApp),
    Job(TsuruJob),
    Platform(TsuruPlatform),
}

impl Tenant {
    pub fn category(&self) -> TenantCategory {
        match self {
            Tenant::App(_) => TenantCategory::App,
            Tenant::Job(_) => TenantCategory::Job,
            Tenant::Platform(_) => TenantCategory::Platform,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Tenant::App(app) => &app.name,
            Tenant::Job(job) => &job.name,
            Tenant::Platform(platform) => &platform.name,
        }
    }

    pub fn team(&self) -> Option<&str> {
        let team = match self {
            Tenant::App(app) => &app.team,
            Tenant::Job(job) => &job.team,
            Tenant::Platform(_) => return None,
        };
        (!team.is_empty()).then_some(team.as_str())
    }

    pub fn env_vars(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Tenant::App(app) => Some(&app.env_vars),
            Tenant::Job(job) => Some(&job.env_vars),
            Tenant::Platform(_) => None,
        }
    }
}

// ── Request ────────────────────────────────────────────────────────

/// Registry push behaviour for the exported image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOptions {
    /// Skip pushing to the destination registry.
    #[serde(default)]
    pub disable: bool,
    /// Allow plain-HTTP / self-signed registries.
    #[serde(default)]
    pub insecure_registry: bool,
}

/// A single build submitted by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub kind: BuildKind,
    pub tenant: Option<Tenant>,
    #[serde(default)]
    pub source_image: String,
    #[serde(default)]
    pub destination_images: Vec<String>,
    /// Gzip tarball: app sources for source uploads, build context for
    /// containerfile builds. May be empty depending on the kind.
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub containerfile: String,
    pub push_options: Option<PushOptions>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl BuildRequest {
    pub fn app(&self) -> Option<&TsuruApp> {
        match &self.tenant {
            Some(Tenant::App(app)) => Some(app),
            _ => None,
        }
    }

    /// Whether the exported image is pushed (default `true`).
    pub fn push_enabled(&self) -> bool {
        self.push_options.as_ref().is_none_or(|p| !p.disable)
    }

    pub fn insecure_registry(&self) -> bool {
        self.push_options
            .as_ref()
            .is_some_and(|p| p.insecure_registry)
    }

    /// Environment injected into the build as a secret.
    ///
    /// Tenant variables first, request-level variables override them.
    pub fn build_env(&self) -> BTreeMap<String, String> {
        let mut envs = self
            .tenant
            .as_ref()
            .and_then(Tenant::env_vars)
            .cloned()
            .unwrap_or_default();
        envs.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        envs
    }
}

// ── Response ───────────────────────────────────────────────────────

/// Runtime configuration read from the produced image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    /// Sorted, formatted as `port/proto`.
    #[serde(default)]
    pub exposed_ports: Vec<String>,
}

/// Platform configuration extracted from a successful build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsuruConfig {
    #[serde(default)]
    pub procfile: String,
    #[serde(default)]
    pub tsuru_yaml: String,
    pub image_config: Option<ImageConfig>,
}

/// One message on the build response stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResponse {
    Output(String),
    TsuruConfig(TsuruConfig),
}
