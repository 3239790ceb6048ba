//! Local build context staging.
//!
//! Every build gets a private temporary directory holding the build
//! descriptor (`Dockerfile`), the app source archive or the unpacked
//! caller context, and the tenant environment as a shell file. The
//! environment file is handed to the engine as a secret mount, so it
//! never ends up in an image layer. The directory is removed when the
//! `StagedContext` is dropped.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::read::GzDecoder;
use kiln_core::SecretSource;
use kiln_core::metadata::ENV_VARS_SECRET_ID;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::containerfile::APP_ARCHIVE_NAME;
use crate::error::{BuildError, BuildResult};

pub const DOCKERFILE_NAME: &str = "Dockerfile";
pub const ENV_VARS_FILE_NAME: &str = "envs.sh";

/// What goes into a staged context.
#[derive(Debug, Clone, Default)]
pub struct StageSpec {
    pub containerfile: String,
    /// Copied verbatim as `application.tar.gz`.
    pub app_archive: Option<Vec<u8>>,
    /// Gzip tarball unpacked into the context root.
    pub context_archive: Option<Vec<u8>>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct StagedContext {
    dir: TempDir,
    has_env: bool,
}

impl StagedContext {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Secret mounts to attach to solves over this context.
    pub fn secrets(&self) -> Vec<SecretSource> {
        if !self.has_env {
            return Vec::new();
        }
        vec![SecretSource {
            id: ENV_VARS_SECRET_ID.to_string(),
            path: self.path().join(ENV_VARS_FILE_NAME),
        }]
    }
}

/// Stage `spec` under `base` (the system temp dir when `None`).
///
/// Aborts with `Cancelled` as soon as `token` fires; a half-written
/// directory is removed once the writer notices.
pub async fn stage(
    base: Option<&Path>,
    spec: StageSpec,
    token: &CancellationToken,
) -> BuildResult<StagedContext> {
    if token.is_cancelled() {
        return Err(BuildError::Cancelled);
    }
    let base = base.map(Path::to_path_buf);
    let task = tokio::task::spawn_blocking(move || stage_blocking(base.as_deref(), &spec));

    tokio::select! {
        _ = token.cancelled() => Err(BuildError::Cancelled),
        joined = task => joined.map_err(|e| BuildError::Internal(format!("staging task failed: {e}")))?,
    }
}

fn stage_blocking(base: Option<&Path>, spec: &StageSpec) -> BuildResult<StagedContext> {
    if let Some(key) = spec.env.keys().find(|k| !is_env_name(k)) {
        return Err(BuildError::InvalidEnvName(key.clone()));
    }

    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix("kiln-");
        b
    };
    let dir = match base {
        Some(base) => builder.tempdir_in(base),
        None => builder.tempdir(),
    }
    .map_err(|source| BuildError::Staging {
        path: base.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir),
        source,
    })?;
    let root = dir.path().to_path_buf();
    let staging = |source: std::io::Error| BuildError::Staging {
        path: root.clone(),
        source,
    };

    if let Some(archive) = &spec.context_archive {
        unpack_context(archive, &root)?;
    }

    fs::write(root.join(DOCKERFILE_NAME), &spec.containerfile).map_err(staging)?;

    if let Some(archive) = &spec.app_archive {
        fs::write(root.join(APP_ARCHIVE_NAME), archive).map_err(staging)?;
    }

    let has_env = !spec.env.is_empty();
    if has_env {
        write_env_file(&root.join(ENV_VARS_FILE_NAME), &spec.env).map_err(staging)?;
    }

    debug!(dir = %root.display(), "staged build context");
    Ok(StagedContext { dir, has_env })
}

fn unpack_context(archive: &[u8], root: &Path) -> BuildResult<()> {
    crate::extract::ensure_gzip(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    tar.set_preserve_permissions(true);
    tar.unpack(root).map_err(BuildError::Archive)
}

fn write_env_file(path: &Path, env: &BTreeMap<String, String>) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "# Environment of the tsuru app. Generated by kiln.")?;
    for (key, value) in env {
        writeln!(file, "export {key}={}", shell_words::quote(value))?;
    }
    file.flush()
}

/// Whether `key` can be exported by a POSIX shell: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
