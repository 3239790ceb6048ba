//! Locate the Procfile and tsuru.yaml of an app.
//!
//! The files are looked up in three places depending on the build:
//! the uploaded source archive (gzip tarball), the root filesystem the
//! engine exported from a built image (plain tarball), or the staged
//! context directory.

use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use walkdir::WalkDir;

use crate::error::{BuildError, BuildResult};

pub const PROCFILE_NAME: &str = "Procfile";

/// tsuru.yaml names in order of precedence.
pub const TSURU_YAML_CANDIDATES: [&str; 4] = ["tsuru.yml", "tsuru.yaml", "app.yml", "app.yaml"];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppFiles {
    pub procfile: String,
    pub tsuru_yaml: String,
}

/// Files found so far, keyed by candidate index. Precedence is decided
/// once every entry has been seen.
#[derive(Default)]
struct Found {
    procfile: Option<String>,
    yaml: [Option<String>; TSURU_YAML_CANDIDATES.len()],
}

impl Found {
    fn offer(&mut self, name: &str, read: impl FnOnce() -> io::Result<String>) -> io::Result<()> {
        if name == PROCFILE_NAME {
            if self.procfile.is_none() {
                self.procfile = Some(read()?);
            }
        } else if let Some(i) = TSURU_YAML_CANDIDATES.iter().position(|c| *c == name)
            && self.yaml[i].is_none()
        {
            self.yaml[i] = Some(read()?);
        }
        Ok(())
    }

    fn finish(self) -> AppFiles {
        AppFiles {
            procfile: self.procfile.unwrap_or_default(),
            tsuru_yaml: self.yaml.into_iter().flatten().next().unwrap_or_default(),
        }
    }
}

/// Fail with `NotGzip` unless `data` starts with the gzip magic bytes.
pub fn ensure_gzip(data: &[u8]) -> BuildResult<()> {
    if data.starts_with(&GZIP_MAGIC) {
        return Ok(());
    }
    Err(BuildError::NotGzip(io::Error::new(
        io::ErrorKind::InvalidData,
        "invalid gzip header",
    )))
}

/// Read the app files at the root of an uploaded source archive.
pub fn from_source_archive(data: &[u8]) -> BuildResult<AppFiles> {
    ensure_gzip(data)?;
    scan_tar(GzDecoder::new(data), "")
}

/// Read the app files under `working_dir` of an exported image filesystem.
pub fn from_image_tarball(data: &[u8], working_dir: &str) -> BuildResult<AppFiles> {
    scan_tar(data, working_dir.trim_matches('/'))
}

/// Read the app files at the top level of `dir`.
pub fn from_directory(dir: &Path) -> BuildResult<AppFiles> {
    let mut found = Found::default();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| BuildError::Staging {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        found
            .offer(name, || read_lossy(std::fs::File::open(entry.path())?))
            .map_err(|source| BuildError::Staging {
                path: entry.path().to_path_buf(),
                source,
            })?;
    }
    Ok(found.finish())
}

fn scan_tar(reader: impl Read, dir: &str) -> BuildResult<AppFiles> {
    let mut archive = tar::Archive::new(reader);
    let mut found = Found::default();
    for entry in archive.entries().map_err(BuildError::Archive)? {
        let entry = entry.map_err(BuildError::Archive)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = {
            let path = entry.path().map_err(BuildError::Archive)?;
            let path = path.to_string_lossy();
            let path = path.trim_start_matches("./").trim_start_matches('/');
            if dir.is_empty() {
                path.to_string()
            } else {
                match path.strip_prefix(dir).and_then(|p| p.strip_prefix('/')) {
                    Some(name) => name.to_string(),
                    None => continue,
                }
            }
        };
        found
            .offer(&name, || read_lossy(entry))
            .map_err(BuildError::Archive)?;
    }
    Ok(found.finish())
}

fn read_lossy(mut r: impl Read) -> io::Result<String> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{gzip_tar, gzip_tar_with_specials, plain_tar};

    #[test]
    fn finds_files_in_source_archive() {
        let data = gzip_tar(&[
            ("./Procfile", "web: python app.py\n"),
            ("./tsuru.yaml", "hooks:\n  build:\n    - make\n"),
            ("./app.py", "print('hi')"),
        ]);
        let files = from_source_archive(&data).unwrap();
        assert_eq!(files.procfile, "web: python app.py\n");
        assert_eq!(files.tsuru_yaml, "hooks:\n  build:\n    - make\n");
    }

    #[test]
    fn yaml_precedence_ignores_archive_order() {
        let data = gzip_tar(&[
            ("app.yaml", "from: app.yaml"),
            ("tsuru.yaml", "from: tsuru.yaml"),
            ("tsuru.yml", "from: tsuru.yml"),
        ]);
        assert_eq!(from_source_archive(&data).unwrap().tsuru_yaml, "from: tsuru.yml");

        let data = gzip_tar(&[("app.yaml", "from: app.yaml"), ("app.yml", "from: app.yml")]);
        assert_eq!(from_source_archive(&data).unwrap().tsuru_yaml, "from: app.yml");
    }

    #[test]
    fn nested_files_do_not_count() {
        let data = gzip_tar(&[("sub/Procfile", "web: nope"), ("sub/tsuru.yml", "nope: true")]);
        assert_eq!(from_source_archive(&data).unwrap(), AppFiles::default());
    }

    #[test]
    fn only_regular_files() {
        let data = gzip_tar_with_specials(&[("Procfile", "web: ./start")]);
        let files = from_source_archive(&data).unwrap();
        assert_eq!(files.procfile, "web: ./start");
        assert_eq!(files.tsuru_yaml, "");
    }

    #[test]
    fn source_must_be_gzip() {
        let err = from_source_archive(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, BuildError::NotGzip(_)));
        assert!(err.to_string().starts_with("app source data must be a GZIP compressed file"));

        let err = from_source_archive(&plain_tar(&[("Procfile", "web: x")])).unwrap_err();
        assert!(matches!(err, BuildError::NotGzip(_)));
    }

    #[test]
    fn image_filesystem_under_working_dir() {
        let data = plain_tar(&[
            ("Procfile", "web: wrong-root"),
            ("home/application/current/Procfile", "web: ./bin/server"),
            ("./home/application/current/tsuru.yaml", "healthcheck:\n  path: /healthz\n"),
            ("home/application/current/nested/app.yml", "nope: true"),
        ]);
        let files = from_image_tarball(&data, "/home/application/current/").unwrap();
        assert_eq!(files.procfile, "web: ./bin/server");
        assert_eq!(files.tsuru_yaml, "healthcheck:\n  path: /healthz\n");
    }

    #[test]
    fn image_filesystem_at_root() {
        let data = plain_tar(&[("Procfile", "web: ./run"), ("app/Procfile", "web: nope")]);
        assert_eq!(from_image_tarball(&data, "/").unwrap().procfile, "web: ./run");
    }

    #[test]
    fn scans_context_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Procfile"), "worker: celery").unwrap();
        std::fs::write(dir.path().join("app.yaml"), "hooks: {}").unwrap();
        std::fs::create_dir(dir.path().join("tsuru.yml")).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/tsuru.yaml"), "nope: true").unwrap();

        let files = from_directory(dir.path()).unwrap();
        assert_eq!(files.procfile, "worker: celery");
        assert_eq!(files.tsuru_yaml, "hooks: {}");
    }
}
