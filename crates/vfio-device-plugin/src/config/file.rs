use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading the settings file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Which sysfs walk produces the device inventory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStrategyKind {
    /// Walk the passthrough driver directory.
    #[default]
    #[display("driver")]
    Driver,
    /// Walk network interfaces and their virtual functions.
    #[display("netdev")]
    Netdev,
}

/// Plugin settings read from the YAML configuration file.
///
/// Every key is optional, an empty document yields the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginConfig {
    /// Namespace part of every advertised resource name
    pub resource_namespace: String,
    /// Passthrough driver the devices must be bound to
    pub driver: String,
    pub discovery_strategy: DiscoveryStrategyKind,
    /// Hex vendor ids to advertise, empty allows every vendor
    pub vendor_allow_list: Vec<String>,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    /// Kubelet device plugin directory
    pub plugin_dir: PathBuf,
    /// Kubelet registration socket, defaults to `kubelet.sock` inside `plugin_dir`
    pub kubelet_socket: Option<PathBuf>,
    /// Seconds to wait before retrying a failed registration cycle
    pub retry_interval: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            resource_namespace: "kr-vf".to_string(),
            driver: "vfio-pci".to_string(),
            discovery_strategy: DiscoveryStrategyKind::default(),
            vendor_allow_list: Vec::new(),
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            plugin_dir: PathBuf::from(device_plugin_pb::DEVICE_PLUGIN_PATH),
            kubelet_socket: None,
            retry_interval: 5,
        }
    }
}

impl PluginConfig {
    /// Parse settings from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        let is_blank = content.lines().all(|line| {
            let line = line.trim();
            line.is_empty() || line.starts_with('#')
        });
        if is_blank {
            return Ok(Self::default());
        }

        // an explicit `~` or `null` document
        let config: Option<Self> = serde_yaml::from_str(content)?;
        Ok(config.unwrap_or_default())
    }

    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join("kubelet.sock"))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

/// load plugin settings from config file
pub async fn load(path: &Path) -> Result<PluginConfig, ConfigError> {
    tracing::info!("Loading configuration from {:?}", path);

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let config = PluginConfig::from_yaml(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::debug!("Loaded configuration: {:?}", config);
    Ok(config)
}
