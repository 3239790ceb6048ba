//! Fail-fast build request validation.
//!
//! Runs before any remote call. Rules are a function of the request kind
//! only; the first violated rule is reported.

use thiserror::Error;

use crate::error::Code;
use crate::types::{BuildOrigin, BuildRequest, TenantCategory};

/// A malformed build request. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    fn new(msg: &str) -> Self {
        Self(msg.to_string())
    }

    pub fn code(&self) -> Code {
        Code::InvalidArgument
    }
}

/// Validate a request against the rules of its kind.
pub fn validate_build_request(r: &BuildRequest) -> Result<(), ValidationError> {
    if r.destination_images.is_empty() {
        return Err(ValidationError::new("destination images not provided"));
    }

    if r.destination_images.iter().any(String::is_empty) {
        return Err(ValidationError::new("destination image cannot be empty"));
    }

    let (Some(category), Some(origin)) = (r.kind.tenant_category(), r.kind.origin()) else {
        return Err(ValidationError::new("build kind not supported"));
    };

    let tenant_matches = r
        .tenant
        .as_ref()
        .is_some_and(|t| t.category() == category && !t.name().is_empty());
    if !tenant_matches {
        return Err(ValidationError::new(match category {
            TenantCategory::App => "app cannot be empty",
            TenantCategory::Job => "job cannot be empty",
            TenantCategory::Platform => "platform cannot be empty",
        }));
    }

    match origin {
        BuildOrigin::SourceUpload => {
            if r.source_image.is_empty() {
                return Err(ValidationError::new("source image cannot be empty"));
            }
            if r.data.is_empty() {
                return Err(ValidationError::new("app source data not provided"));
            }
        }
        BuildOrigin::ContainerImage => {
            if r.source_image.is_empty() {
                return Err(ValidationError::new("source image cannot be empty"));
            }
        }
        BuildOrigin::ContainerFile => {
            if r.containerfile.is_empty() {
                return Err(ValidationError::new("containerfile cannot be empty"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn app() -> Option<Tenant> {
        Some(Tenant::App(TsuruApp {
            name: "myapp".to_string(),
            ..Default::default()
        }))
    }

    fn source_upload() -> BuildRequest {
        BuildRequest {
            kind: BuildKind::AppBuildWithSourceUpload,
            tenant: app(),
            source_image: "tsuru/python:latest".to_string(),
            destination_images: vec!["registry.example.com/tsuru/app-myapp:v1".to_string()],
            data: vec![0x1f, 0x8b],
            ..Default::default()
        }
    }

    fn err(r: &BuildRequest) -> String {
        validate_build_request(r).unwrap_err().to_string()
    }

    #[test]
    fn valid_source_upload() {
        assert!(validate_build_request(&source_upload()).is_ok());
    }

    #[test]
    fn destination_images_missing() {
        let mut r = source_upload();
        r.destination_images.clear();
        assert_eq!(err(&r), "destination images not provided");
    }

    #[test]
    fn destination_image_empty_element() {
        let mut r = source_upload();
        r.destination_images = vec![String::new()];
        assert_eq!(err(&r), "destination image cannot be empty");
    }

    #[test]
    fn destination_checked_before_anything_else() {
        let r = BuildRequest {
            kind: BuildKind::AppBuildWithSourceUpload,
            ..Default::default()
        };
        assert_eq!(err(&r), "destination images not provided");
    }

    #[test]
    fn unspecified_kind_rejected() {
        let mut r = source_upload();
        r.kind = BuildKind::Unspecified;
        assert_eq!(err(&r), "build kind not supported");
    }

    #[test]
    fn tenant_must_match_kind() {
        let mut r = source_upload();
        r.tenant = Some(Tenant::Job(TsuruJob {
            name: "myjob".to_string(),
            ..Default::default()
        }));
        assert_eq!(err(&r), "app cannot be empty");

        r.tenant = None;
        assert_eq!(err(&r), "app cannot be empty");

        r.kind = BuildKind::JobCreateWithContainerImage;
        assert_eq!(err(&r), "job cannot be empty");

        r.kind = BuildKind::PlatformWithContainerFile;
        assert_eq!(err(&r), "platform cannot be empty");
    }

    #[test]
    fn source_upload_requires_image_and_data() {
        let mut r = source_upload();
        r.source_image.clear();
        assert_eq!(err(&r), "source image cannot be empty");

        let mut r = source_upload();
        r.data.clear();
        assert_eq!(err(&r), "app source data not provided");
    }

    #[test]
    fn containerfile_kinds_require_containerfile() {
        let r = BuildRequest {
            kind: BuildKind::PlatformWithContainerFile,
            tenant: Some(Tenant::Platform(TsuruPlatform {
                name: "python".to_string(),
            })),
            destination_images: vec!["tsuru/python:latest".to_string()],
            ..Default::default()
        };
        assert_eq!(err(&r), "containerfile cannot be empty");

        let r = BuildRequest {
            containerfile: "FROM alpine\n".to_string(),
            ..r
        };
        assert!(validate_build_request(&r).is_ok());
    }

    #[test]
    fn container_image_kind_needs_no_data() {
        let r = BuildRequest {
            kind: BuildKind::AppBuildWithContainerImage,
            data: Vec::new(),
            ..source_upload()
        };
        assert!(validate_build_request(&r).is_ok());
    }

    #[test]
    fn validation_errors_are_invalid_argument() {
        let mut r = source_upload();
        r.destination_images.clear();
        assert_eq!(
            validate_build_request(&r).unwrap_err().code(),
            Code::InvalidArgument
        );
    }
}
