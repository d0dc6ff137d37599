use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodewardenConfig {
    /// Control socket the UI process connects to. No bridge is served when unset.
    pub socket: Option<PathBuf>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    pub node: NodeConfig,
}

/// Everything needed to launch and supervise the node. Built once and never mutated.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Command line, split with shell rules. Words may use `{tls_dir}`, `{log_file}`,
    /// `{working_directory}` and `{api_port}`.
    pub command: String,
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    pub tls_dir: PathBuf,
    pub log_file: PathBuf,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    pub api_port: u16,
    #[serde(default)]
    pub readiness: ReadinessProbe,
    /// Output line announcing that the node is about to apply an update.
    pub update_marker: Option<String>,
    #[serde(default = "default_update_exit_code")]
    pub update_exit_code: i32,
    #[serde(with = "humantime_serde", default = "default_startup_timeout")]
    pub startup_timeout: Duration,
    #[serde(default = "default_startup_max_retries")]
    pub startup_max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_crash_cooldown")]
    pub crash_cooldown: Duration,
    #[serde(with = "humantime_serde", default = "default_update_timeout")]
    pub update_timeout: Duration,
    #[serde(default)]
    pub stop: StopProperties,
    /// Bytes of recent node output kept for crash reports.
    #[serde(default = "default_output_cache_size")]
    pub output_cache_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ReadinessProbe {
    LogMarker {
        marker: String,
    },
    Port {
        /// Defaults to the node's API address.
        host: Option<String>,
        port: Option<u16>,
        #[serde(with = "humantime_serde", default = "default_probe_interval")]
        interval: Duration,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct StopProperties {
    #[serde(default)]
    pub graceful_signal: StopSignal,
    #[serde(with = "humantime_serde", default = "default_term_timeout")]
    pub term_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_kill_timeout")]
    pub kill_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StopSignal {
    Term,
    Int,
    Hup,
    Quit,
}

impl NodewardenConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: NodewardenConfig =
            serde_yaml::from_reader(File::open(path).wrap_err("Failed to read config")?)
                .wrap_err("Failed to parse config!")?;
        config.node.validate()?;
        Ok(config)
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            bail!("Node command is empty");
        }
        if self.startup_max_retries == 0 {
            bail!("startup-max-retries must allow at least one launch");
        }
        if self.output_cache_size == 0 {
            bail!("output-cache-size must be positive");
        }
        Ok(())
    }
}

impl From<StopSignal> for Signal {
    fn from(value: StopSignal) -> Self {
        match value {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Hup => Signal::SIGHUP,
            StopSignal::Quit => Signal::SIGQUIT,
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_working_directory() -> PathBuf {
    ".".into()
}

fn default_api_host() -> String {
    "127.0.0.1".into()
}

fn default_update_exit_code() -> i32 {
    20
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_startup_max_retries() -> u32 {
    5
}

fn default_crash_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_update_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_output_cache_size() -> u32 {
    4096
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_term_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        ReadinessProbe::Port {
            host: None,
            port: None,
            interval: default_probe_interval(),
        }
    }
}

impl Default for StopProperties {
    fn default() -> Self {
        Self {
            graceful_signal: Default::default(),
            term_timeout: default_term_timeout(),
            kill_timeout: default_kill_timeout(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::Term
    }
}

#[cfg(test)]
pub(crate) fn test_node_config() -> NodeConfig {
    NodeConfig {
        command: "cardano-node run".into(),
        working_directory: ".".into(),
        tls_dir: "/tmp/tls".into(),
        log_file: "/tmp/node.log".into(),
        api_host: default_api_host(),
        api_port: 8090,
        readiness: ReadinessProbe::LogMarker {
            marker: "ready".into(),
        },
        update_marker: Some("update pending".into()),
        update_exit_code: default_update_exit_code(),
        startup_timeout: Duration::from_secs(5),
        startup_max_retries: 2,
        crash_cooldown: default_crash_cooldown(),
        update_timeout: default_update_timeout(),
        stop: StopProperties::default(),
        output_cache_size: default_output_cache_size(),
    }
}
