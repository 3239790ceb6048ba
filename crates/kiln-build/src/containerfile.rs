//! Build descriptors generated for builds that bring no Containerfile.

use kiln_core::metadata::{DEFAULT_APP_WORKING_DIR, ENV_VARS_SECRET_ID};

/// Where the app source archive is placed inside the staged context.
pub const APP_ARCHIVE_NAME: &str = "application.tar.gz";

/// Secret mount target inside build steps.
pub const ENV_VARS_SECRET_TARGET: &str = "/var/run/secrets/envs.sh";

/// Descriptor for a source upload: unpack the archive on top of the
/// platform image with the tenant environment sourced, then run every
/// build hook in order.
pub fn source_upload(image: &str, build_hooks: &[String]) -> String {
    let mut out = format!(
        "FROM {image}\n\
         \n\
         COPY ./{APP_ARCHIVE_NAME} /home/application/archive.tar.gz\n\
         \n\
         RUN --mount=type=secret,id={ENV_VARS_SECRET_ID},target={ENV_VARS_SECRET_TARGET},uid=1000,gid=1000 \\\n    \
         [ -f {ENV_VARS_SECRET_TARGET} ] && . {ENV_VARS_SECRET_TARGET} \\\n    \
         && /var/lib/tsuru/deploy archive file:///home/application/archive.tar.gz \\\n"
    );
    for hook in build_hooks {
        out.push_str(&format!("    && {{ {hook}; }} \\\n"));
    }
    out.push_str("    && :\n\n");
    out.push_str(&format!("WORKDIR {DEFAULT_APP_WORKING_DIR}\n"));
    out
}

/// Descriptor that re-exports an existing image as is.
pub fn from_image(image: &str) -> String {
    format!("FROM {image}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_upload_without_hooks() {
        let expected = "\
FROM tsuru/python:3.12

COPY ./application.tar.gz /home/application/archive.tar.gz

RUN --mount=type=secret,id=tsuru-app-envvars,target=/var/run/secrets/envs.sh,uid=1000,gid=1000 \\
    [ -f /var/run/secrets/envs.sh ] && . /var/run/secrets/envs.sh \\
    && /var/lib/tsuru/deploy archive file:///home/application/archive.tar.gz \\
    && :

WORKDIR /home/application/current
";
        assert_eq!(source_upload("tsuru/python:3.12", &[]), expected);
    }

    #[test]
    fn hooks_are_chained_in_order() {
        let hooks = vec!["mkdir -p /tmp/foo".to_string(), "echo \"hi\" > /tmp/foo/bar".to_string()];
        let out = source_upload("tsuru/python:3.12", &hooks);
        assert!(out.contains(
            "file:///home/application/archive.tar.gz \\\n    && { mkdir -p /tmp/foo; } \\\n    && { echo \"hi\" > /tmp/foo/bar; } \\\n    && :\n"
        ));
    }

    #[test]
    fn plain_from() {
        assert_eq!(from_image("registry.example/app:v1"), "FROM registry.example/app:v1\n");
    }
}
