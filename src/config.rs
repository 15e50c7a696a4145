use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{
    group::GroupOptions,
    port::bus::{ConnectionOptions, ReceiverOptions},
    remote::RemoteOptions,
    rpc::RpcOptions
};

/// Configuration for the dispatch binary and library defaults
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub bus:    BusConfig,
    pub group:  GroupConfig,
    pub remote: RemoteConfig,
    pub daemon: DaemonConfig,
    pub rpc:    RpcConfig
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub close_timeout_ms:  u64,
    pub receiver_capacity: usize
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { close_timeout_ms: 5_000, receiver_capacity: 1 }
    }
}

impl BusConfig {
    pub fn connection(&self) -> ConnectionOptions {
        ConnectionOptions { reconnect: true, close_timeout: Duration::from_millis(self.close_timeout_ms) }
    }

    pub fn receiver(&self) -> ReceiverOptions {
        ReceiverOptions { capacity: self.receiver_capacity, ephemeral: false }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GroupConfig {
    pub max_concurrent:   usize,
    pub poll_interval_ms: u64
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self { max_concurrent: 8, poll_interval_ms: 10_000 }
    }
}

impl GroupConfig {
    pub fn options(&self) -> GroupOptions {
        GroupOptions { max_concurrent: self.max_concurrent, poll_interval: Duration::from_millis(self.poll_interval_ms) }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub connect_attempts: u32,
    pub retry_min_ms:     u64,
    pub retry_max_ms:     u64,
    pub max_connections:  usize,
    pub max_frame_bytes:  usize,
    /// Host name workers use to reach the job server
    pub advertise_host:   Option<String>
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            retry_min_ms:     1_000,
            retry_max_ms:     5_000,
            max_connections:  64,
            max_frame_bytes:  64 * 1024 * 1024,
            advertise_host:   None
        }
    }
}

impl RemoteConfig {
    pub fn options(&self) -> RemoteOptions {
        RemoteOptions {
            connect_attempts: self.connect_attempts,
            retry_min:        Duration::from_millis(self.retry_min_ms),
            retry_max:        Duration::from_millis(self.retry_max_ms.max(self.retry_min_ms)),
            max_connections:  self.max_connections.max(1),
            max_frame_bytes:  self.max_frame_bytes
        }
    }

    /// Configured advertise host, else this machine's host name
    pub fn advertise_host(&self) -> String {
        self.advertise_host
            .clone()
            .unwrap_or_else(|| whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub max_repost:       u32,
    pub loop_interval_ms: u64,
    pub echo_grace_ms:    u64,
    /// How long a job-channel message waits for its reader before it is deadlettered
    pub message_ttl_ms:   u64,
    /// How long stopped sessions and killed jobs are remembered
    pub retention_secs:   u64
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_repost:       3,
            loop_interval_ms: 1_000,
            echo_grace_ms:    30_000,
            message_ttl_ms:   60_000,
            retention_secs:   86_400
        }
    }
}

impl DaemonConfig {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn echo_grace(&self) -> Duration {
        Duration::from_millis(self.echo_grace_ms)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_millis(self.message_ttl_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms:         u64,
    pub forward_exceptions: bool
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000, forward_exceptions: false }
    }
}

impl RpcConfig {
    pub fn options(&self) -> RpcOptions {
        RpcOptions { timeout: Duration::from_millis(self.timeout_ms), forward_exceptions: self.forward_exceptions }
    }
}

/// Get the project directories for cross-platform config path resolution
pub fn get_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "dispatch").context("Failed to determine project directories")
}

/// Default config file path, `<config_dir>/config.yaml`
pub fn get_config_file_path() -> Result<PathBuf> {
    Ok(get_project_dirs()?.config_dir().join("config.yaml"))
}

/// Load configuration from `path`, or from the default location when `None`.
/// A missing file yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<DispatchConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => get_config_file_path()?
    };

    if !config_path.exists() {
        return Ok(DispatchConfig::default());
    }

    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", config_path.display()))
}

/// Save configuration to `path`, creating parent directories
pub fn save_config(config: &DispatchConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }

    let content = serde_yaml::to_string(config).context("Failed to serialize config")?;
    fs::write(path, content).with_context(|| format!("Failed to write config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.yaml"))).unwrap();

        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.group.options(), GroupOptions::default());
        assert_eq!(config.remote.options(), RemoteOptions::default());
        assert_eq!(config.rpc.options().timeout, Duration::from_secs(30));
        assert_eq!(config.daemon.max_repost, 3);
        assert_eq!(config.daemon.echo_grace(), Duration::from_secs(30));
        assert_eq!(config.daemon.message_ttl(), Duration::from_secs(60));
        assert_eq!(config.daemon.retention(), Duration::from_secs(86_400));
        assert_eq!(config.bus.receiver().capacity, 1);
        assert_eq!(config.bus.connection().close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "group:\n  max_concurrent: 2\ndaemon:\n  loop_interval_ms: 250\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.group.max_concurrent, 2);
        assert_eq!(config.group.poll_interval_ms, 10_000);
        assert_eq!(config.daemon.loop_interval(), Duration::from_millis(250));
        assert_eq!(config.remote, RemoteConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = DispatchConfig::default();
        config.rpc.forward_exceptions = true;
        config.remote.advertise_host = Some("master01".to_string());

        save_config(&config, &path).unwrap();
        let reloaded = load_config(Some(&path)).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.remote.advertise_host(), "master01");
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "group: [not, a, map]").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
