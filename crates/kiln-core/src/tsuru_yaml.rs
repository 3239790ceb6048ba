//! The tsuru.yaml schema.
//!
//! Only `hooks.build` drives the build itself; the rest is parsed so a
//! malformed file fails the build instead of the later deploy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Parsed tsuru.yaml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TsuruYamlData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startupcheck: Option<Startupcheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<Process>,
}

impl TsuruYamlData {
    /// Parse tsuru.yaml text. Empty text yields the default document.
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn build_hooks(&self) -> &[String] {
        self.hooks.as_ref().map(|h| h.build.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub restart: RestartHooks,
    #[serde(default)]
    pub build: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartHooks {
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Healthcheck {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub allowed_failures: i32,
    #[serde(default)]
    pub interval_seconds: i32,
    #[serde(default)]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub deploy_timeout_seconds: i32,
    #[serde(default)]
    pub force_restart: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Startupcheck {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub allowed_failures: i32,
    #[serde(default)]
    pub interval_seconds: i32,
    #[serde(default)]
    pub timeout_seconds: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startupcheck: Option<Startupcheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub groups: BTreeMap<String, BTreeMap<String, KubernetesProcessConfig>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesProcessConfig {
    #[serde(default)]
    pub ports: Vec<KubernetesPortConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesPortConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub target_port: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_has_no_hooks() {
        let data = TsuruYamlData::parse("").unwrap();
        assert!(data.build_hooks().is_empty());
    }

    #[test]
    fn parses_build_hooks_and_healthcheck() {
        let data = TsuruYamlData::parse(
            r#"
hooks:
  build:
    - mkdir -p /tmp/foo
    - echo "Hello world" > /tmp/foo/bar
  restart:
    before:
      - python manage.py migrate
healthcheck:
  path: /healthz
  allowed_failures: 3
kubernetes:
  groups:
    web:
      web:
        ports:
          - name: http
            protocol: TCP
            port: 80
            target_port: 8888
"#,
        )
        .unwrap();

        assert_eq!(
            data.build_hooks(),
            &["mkdir -p /tmp/foo", r#"echo "Hello world" > /tmp/foo/bar"#]
        );
        assert_eq!(data.healthcheck.as_ref().unwrap().allowed_failures, 3);
        let ports = &data.kubernetes.as_ref().unwrap().groups["web"]["web"].ports;
        assert_eq!(ports[0].target_port, 8888);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(TsuruYamlData::parse("hooks: [unterminated").is_err());
    }
}
