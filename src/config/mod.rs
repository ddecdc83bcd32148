//! Configuration module
//!
//! Handles loading and saving arbor configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_PORT;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Where this node sits in the overlay
    #[serde(default)]
    pub node: NodeConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Executor settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Result files
    #[serde(default)]
    pub results: ResultsConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this node
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Overlay placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Identity announced to peers (defaults to the listen address)
    pub advertise: Option<SocketAddr>,
    /// Mother to join; none makes this node a root
    pub mother: Option<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            advertise: None,
            mother: None,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Initial per-session buffer size
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_buffer_size() -> usize {
    4096
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Batches checked at once
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Time budget of one batch in ms
    #[serde(default = "default_deadline")]
    pub deadline_ms: u64,
    /// Values accepted from requesters at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u64,
}

fn default_pool_size() -> usize {
    5
}

fn default_deadline() -> u64 {
    10_000
}

fn default_max_in_flight() -> u64 {
    1000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            deadline_ms: default_deadline(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl WorkerConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Result files configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// Directory receiving `<request_id>-results.txt` files
    #[serde(default = "default_results_directory")]
    pub directory: PathBuf,
}

fn default_results_directory() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            directory: default_results_directory(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("arbor/config.toml")),
            Some(PathBuf::from("./arbor.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Using configuration from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Identity this node announces to its peers
    pub fn advertised(&self) -> SocketAddr {
        self.node.advertise.unwrap_or(self.node.listen)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "worker-1".to_string(),
            verbose: false,
        },
        node: NodeConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT + 1)),
            advertise: Some(SocketAddr::from(([192, 168, 1, 20], DEFAULT_PORT + 1))),
            mother: Some(format!("192.168.1.10:{}", DEFAULT_PORT)),
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
