//! Daemon settings: command line flags layered over `kiln.toml`.
//!
//! Precedence is flag, then file, then built-in default. Boolean flags
//! can only switch a feature on; the file is the place to turn one off.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use kiln_build::DispatcherConfig;
use kiln_core::{KilnConfig, parse_duration};
use kiln_discovery::DiscoveryOptions;

pub const DEFAULT_PORT: u16 = 4444;
pub const DEFAULT_DOWNSCALE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Parser)]
#[command(name = "kilnd", about = "Kiln container build daemon")]
pub struct Cli {
    /// Path to a kiln.toml configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port of the HTTP endpoint (build, health, metrics).
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory under which build contexts are staged.
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Static build engine, e.g. tcp://buildkitd:1234.
    #[arg(long)]
    pub engine_address: Option<String>,

    /// Prune the engine cache before every build.
    #[arg(long)]
    pub disable_cache: bool,

    /// Discover a worker pod for app builds.
    #[arg(long)]
    pub discovery: bool,

    #[arg(long)]
    pub pod_selector: Option<String>,

    /// Namespace of the worker pods.
    #[arg(long)]
    pub namespace: Option<String>,

    #[arg(long)]
    pub lease_prefix: Option<String>,

    /// Worker statefulset to scale up from (and down to) zero.
    #[arg(long)]
    pub statefulset: Option<String>,

    /// Port of the build engine inside worker pods.
    #[arg(long)]
    pub worker_port: Option<u16>,

    #[arg(long)]
    pub scaling_disabled: bool,

    /// Look for workers in the namespace of the tenant app.
    #[arg(long)]
    pub use_tenant_namespace: bool,

    /// Label the leased worker pod with the tenant app.
    #[arg(long)]
    pub set_tenant_labels: bool,

    /// Give up discovering a worker after this long (e.g. 5m).
    #[arg(long, value_parser = duration_arg)]
    pub discovery_timeout: Option<Duration>,

    /// Never scale idle worker pools to zero.
    #[arg(long)]
    pub no_downscale: bool,

    /// Idle time before a worker pool is scaled to zero (e.g. 2h).
    #[arg(long, value_parser = duration_arg)]
    pub downscale_grace_period: Option<Duration>,

    #[arg(long, value_parser = duration_arg)]
    pub downscale_interval: Option<Duration>,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| format!("invalid duration {s:?} ({e}), expected e.g. 30s, 5m, 2h"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownscaleSettings {
    pub pod_selector: String,
    pub statefulset: String,
    pub grace_period: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub port: u16,
    pub temp_dir: Option<PathBuf>,
    pub engine_address: Option<String>,
    pub disable_cache: bool,
    pub discovery: Option<DiscoveryOptions>,
    pub downscale: Option<DownscaleSettings>,
}

impl Settings {
    pub fn resolve(cli: &Cli, file: &KilnConfig) -> anyhow::Result<Self> {
        let server = file.server.clone().unwrap_or_default();
        let engine = file.engine.clone().unwrap_or_default();
        let disc = file.discovery.clone().unwrap_or_default();
        let down = file.downscale.clone().unwrap_or_default();

        let discovery = if cli.discovery || disc.enabled.unwrap_or(false) {
            let defaults = DiscoveryOptions::default();
            let timeout = match cli.discovery_timeout {
                Some(t) => t,
                None => file_duration("discovery.timeout", disc.timeout.as_deref())?
                    .unwrap_or(defaults.timeout),
            };
            Some(DiscoveryOptions {
                pod_selector: pick(&cli.pod_selector, disc.pod_selector, defaults.pod_selector),
                namespace: pick(&cli.namespace, disc.namespace, defaults.namespace),
                lease_prefix: pick(&cli.lease_prefix, disc.lease_prefix, defaults.lease_prefix),
                statefulset: cli
                    .statefulset
                    .clone()
                    .or(disc.statefulset)
                    .filter(|s| !s.is_empty()),
                port: cli.worker_port.or(disc.port).unwrap_or(defaults.port),
                scaling_disabled: cli.scaling_disabled || disc.scaling_disabled.unwrap_or(false),
                use_tenant_namespace: cli.use_tenant_namespace
                    || disc.use_tenant_namespace.unwrap_or(false),
                set_tenant_labels: cli.set_tenant_labels || disc.set_tenant_labels.unwrap_or(false),
                timeout,
            })
        } else {
            None
        };

        let mut downscale = None;
        if let Some(d) = &discovery
            && let Some(statefulset) = &d.statefulset
            && !d.scaling_disabled
            && !cli.no_downscale
            && down.enabled.unwrap_or(true)
        {
            let grace_period = match cli.downscale_grace_period {
                Some(g) => g,
                None => file_duration("downscale.grace_period", down.grace_period.as_deref())?
                    .unwrap_or(DEFAULT_GRACE_PERIOD),
            };
            let interval = match cli.downscale_interval {
                Some(i) => i,
                None => file_duration("downscale.interval", down.interval.as_deref())?
                    .unwrap_or(DEFAULT_DOWNSCALE_INTERVAL),
            };
            downscale = Some(DownscaleSettings {
                pod_selector: d.pod_selector.clone(),
                statefulset: statefulset.clone(),
                grace_period,
                interval,
            });
        }

        Ok(Self {
            port: cli.port.or(server.port).unwrap_or(DEFAULT_PORT),
            temp_dir: cli
                .temp_dir
                .clone()
                .or_else(|| server.temp_dir.map(PathBuf::from)),
            engine_address: cli
                .engine_address
                .clone()
                .or(engine.address)
                .filter(|a| !a.is_empty()),
            disable_cache: cli.disable_cache || engine.disable_cache.unwrap_or(false),
            discovery,
            downscale,
        })
    }

    /// Whether the daemon talks to the cluster at all.
    pub fn needs_cluster(&self) -> bool {
        self.discovery.is_some()
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            engine_address: self.engine_address.clone(),
            discovery: self.discovery.clone(),
            disable_cache: self.disable_cache,
            temp_dir: self.temp_dir.clone(),
        }
    }
}

fn pick(flag: &Option<String>, file: Option<String>, default: String) -> String {
    flag.clone().or(file).unwrap_or(default)
}

fn file_duration(key: &str, value: Option<&str>) -> anyhow::Result<Option<Duration>> {
    value
        .map(|v| parse_duration(v).map_err(|e| anyhow!("invalid duration for {key}: {v:?} ({e})")))
        .transpose()
}
