//! Configuration module
//!
//! Handles loading and saving VNOC configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{NetworkConfig, DEFAULT_MAX_PENDING_REPLIES};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};

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
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Ceiling on a frame body, in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Maximum simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Queued replies per connection before it stops reading
    #[serde(default = "default_max_pending_replies")]
    pub max_pending_replies: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_pending_replies() -> usize {
    DEFAULT_MAX_PENDING_REPLIES
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            max_frame_size: default_max_frame_size(),
            max_connections: default_max_connections(),
            max_pending_replies: default_max_pending_replies(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server to contact when none is given on the command line
    pub server: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_timeout")]
    pub connect_timeout_ms: u64,
    /// Reply timeout in ms
    #[serde(default = "default_timeout")]
    pub request_timeout_ms: u64,
}

fn default_timeout() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            connect_timeout_ms: default_timeout(),
            request_timeout_ms: default_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "vnoc_net=debug"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
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
            dirs::config_dir().map(|p| p.join("vnoc/config.toml")),
            Some(PathBuf::from("./vnoc.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
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

    /// Network settings derived from the server and client sections
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            port: self.server.port,
            bind_address: self.server.bind_address.clone(),
            max_frame_size: self.server.max_frame_size,
            max_connections: self.server.max_connections,
            max_pending_replies: self.server.max_pending_replies,
            connect_timeout_ms: self.client.connect_timeout_ms,
            request_timeout_ms: self.client.request_timeout_ms,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            ..Default::default()
        },
        client: ClientConfig {
            server: Some("127.0.0.1".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.server.port = 9100;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.server.port, 9100);
        assert_eq!(loaded.server.max_frame_size, config.server.max_frame_size);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[server]\nport = 1234\n").unwrap();
        assert_eq!(parsed.server.port, 1234);
        assert_eq!(parsed.server.bind_address, "0.0.0.0");
        assert_eq!(parsed.client.request_timeout_ms, 5000);

        let network = parsed.network_config();
        assert_eq!(network.port, 1234);
        assert_eq!(network.codec().max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(network.max_pending_replies, DEFAULT_MAX_PENDING_REPLIES);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(Config::load(&path), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.client.server.as_deref(), Some("127.0.0.1"));
    }
}
