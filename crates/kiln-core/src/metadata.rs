//! Label and annotation keys written onto cluster objects.

/// StatefulSet annotation remembering the replica count before scale-down.
pub const LAST_REPLICAS_ANNOTATION: &str = "deploy-agent.tsuru.io/last-replicas";

/// Pod annotation stamped (Unix seconds) when a build takes the worker.
pub const LAST_BUILD_STARTING_ANNOTATION: &str = "deploy-agent.tsuru.io/last-build-starting-time";

/// Pod annotation stamped (Unix seconds) when a build releases the worker.
pub const LAST_BUILD_ENDING_ANNOTATION: &str = "deploy-agent.tsuru.io/last-build-ending-time";

/// Namespace holding the tsuru `App` custom resources.
pub const TSURU_APP_NAMESPACE: &str = "tsuru";

pub const TSURU_APP_NAME_LABEL: &str = "tsuru.io/app-name";
pub const TSURU_APP_TEAM_LABEL: &str = "tsuru.io/app-team";
pub const TSURU_IS_BUILD_LABEL: &str = "tsuru.io/is-build";

/// Working directory of images produced from source uploads.
pub const DEFAULT_APP_WORKING_DIR: &str = "/home/application/current";

/// Secret id under which build environment variables are mounted.
pub const ENV_VARS_SECRET_ID: &str = "tsuru-app-envvars";
