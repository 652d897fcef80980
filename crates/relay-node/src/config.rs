//! Configuration system for the relay node.

use crate::error::{NodeError, Result};
use relay_core::LimitPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default relay port
pub const DEFAULT_PORT: u16 = 40142;

/// Relay node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Relay resource ceilings
    #[serde(default)]
    pub limits: LimitPolicy,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Signing key file path
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Agent string announced to peers in `Welcome`
    #[serde(default = "default_agent")]
    pub agent: String,
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Addresses to listen on
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<IpAddr>,
    /// Port shared by every listen address
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen on loopback only
    #[serde(default)]
    pub local: bool,
    /// Seconds a connection may stay idle before it holds a reservation
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds a destination has to accept an incoming circuit
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: u64,
    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_key_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("relayd/identity.key")
}

fn default_agent() -> String {
    format!("relayd/{}", env!("CARGO_PKG_VERSION"))
}

fn default_listen_addrs() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    ]
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_accept_timeout() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            agent: default_agent(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            port: default_port(),
            local: false,
            idle_timeout_secs: default_idle_timeout(),
            accept_timeout_secs: default_accept_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NetworkConfig {
    /// Socket addresses to bind
    ///
    /// In local mode every configured address is replaced by the loopback
    /// address of the same family.
    #[must_use]
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .listen_addrs
            .iter()
            .map(|ip| {
                let ip = match (self.local, ip) {
                    (false, ip) => *ip,
                    (true, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    (true, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                SocketAddr::new(ip, self.port)
            })
            .collect();
        addrs.dedup();
        addrs
    }

    /// Idle timeout for connections without a reservation
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Time a destination has to accept an incoming circuit
    #[must_use]
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    /// Interval between expiry sweeps
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| NodeError::InvalidConfig(e.to_string().into()))
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| NodeError::InvalidConfig(e.to_string().into()))?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("relayd/config.toml")
    }

    /// Load config from `path`, or fall back to defaults if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.network.listen_addrs.is_empty() {
            return Err(NodeError::InvalidConfig("no listen address".into()));
        }

        if self.network.accept_timeout_secs == 0 {
            return Err(NodeError::InvalidConfig(
                "accept timeout must be at least 1 second".into(),
            ));
        }

        if self.network.idle_timeout_secs == 0 {
            return Err(NodeError::InvalidConfig(
                "idle timeout must be at least 1 second".into(),
            ));
        }

        if self.network.sweep_interval_secs == 0 {
            return Err(NodeError::InvalidConfig(
                "sweep interval must be at least 1 second".into(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(NodeError::InvalidConfig(
                format!(
                    "Invalid log level: {}. Must be one of: {}",
                    self.logging.level,
                    valid_log_levels.join(", ")
                )
                .into(),
            ));
        }

        self.limits.validate()?;
        Ok(())
    }
}
